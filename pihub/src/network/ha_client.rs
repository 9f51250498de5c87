use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{Backoff, NetworkError, SessionConfig, SessionState};
use crate::dispatch::{Command, Delivery, DropReason, EventSink, OutboundEvent};
use crate::health::HealthAggregator;
use crate::keymap::KeymapResolver;
use crate::metrics::SharedMetrics;
use crate::utils::millis;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const STATE_CHANGED_EVENT: &str = "state_changed";
const OUTBOUND_DEST: &str = "ha";
const INBOUND_DEST: &str = "pi";

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutgoingMessage<'a> {
    Auth {
        access_token: &'a str,
    },
    SubscribeEvents {
        id: u64,
        event_type: &'a str,
    },
    GetStates {
        id: u64,
    },
    FireEvent {
        id: u64,
        event_type: &'a str,
        event_data: Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IncomingMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: String,
    },
    AuthOk,
    AuthInvalid {
        #[serde(default)]
        message: String,
    },
    Result {
        id: u64,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        result: Value,
    },
    Event {
        event: EventEnvelope,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    event_type: String,
    #[serde(default)]
    data: Value,
}

/// Writer half of a subscribed connection plus its teardown signal.
struct Link {
    writer: WsWriter,
    lost: Arc<Notify>,
}

/// Persistent Home Assistant websocket session.
///
/// Pushes activity changes into the resolver and inbound commands into the
/// command queue. Outbound sends are accepted only while subscribed; nothing
/// is buffered or retried.
pub struct BackendSession {
    config: SessionConfig,
    link: Mutex<Option<Link>>,
    next_id: AtomicU64,
    state: watch::Sender<SessionState>,
    resolver: Arc<KeymapResolver>,
    health: Arc<HealthAggregator>,
    metrics: SharedMetrics,
    commands: mpsc::Sender<Command>,
}

impl BackendSession {
    pub fn new(
        config: SessionConfig,
        resolver: Arc<KeymapResolver>,
        health: Arc<HealthAggregator>,
        metrics: SharedMetrics,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            link: Mutex::new(None),
            next_id: AtomicU64::new(1),
            state,
            resolver,
            health,
            metrics,
            commands,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Connects, keeps the session alive and reconnects until the task is aborted.
    /// Returns only when the session can never succeed.
    pub async fn run(self: Arc<Self>) -> Result<(), NetworkError> {
        if self.config.token.trim().is_empty() {
            self.set_state(SessionState::Failed);
            self.health.update_backend(|backend| {
                backend.mark_disconnected();
                backend.record_failure(NetworkError::MissingToken.to_string());
            });
            return Err(NetworkError::MissingToken);
        }

        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            let reason = match self.connect_once(&mut backoff).await {
                Ok(()) => "session ended".to_string(),
                Err(err) => err.to_string(),
            };
            self.on_disconnected(&reason).await;

            let delay = backoff.next_delay();
            info!(
                reason,
                attempt = backoff.attempt(),
                delay_ms = millis(delay),
                "backend disconnected; reconnect scheduled"
            );
            sleep(delay).await;
        }
    }

    async fn connect_once(&self, backoff: &mut Backoff) -> Result<(), NetworkError> {
        self.set_state(SessionState::Connecting);
        let request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| NetworkError::RequestBuild(err.to_string()))?;
        let (mut stream, _) = timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| NetworkError::Timeout("connect"))?
            .map_err(|err| NetworkError::ConnectFailed(err.to_string()))?;

        self.set_state(SessionState::Authenticating);
        timeout(self.config.handshake_timeout, self.authenticate(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout("authentication"))??;

        self.set_state(SessionState::Seeding);
        timeout(self.config.handshake_timeout, self.subscribe_and_seed(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout("seed"))??;

        let (writer, reader) = stream.split();
        let lost = Arc::new(Notify::new());
        *self.link.lock().await = Some(Link {
            writer,
            lost: Arc::clone(&lost),
        });
        backoff.reset();
        self.health.update_backend(|backend| backend.mark_connected());
        self.set_state(SessionState::Subscribed);
        info!(url = self.config.url.as_str(), "backend session subscribed");

        self.receive_loop(reader, &lost).await
    }

    async fn authenticate(&self, stream: &mut WsStream) -> Result<(), NetworkError> {
        match recv_message(stream).await? {
            IncomingMessage::AuthOk => return Ok(()),
            IncomingMessage::AuthRequired { ha_version } => {
                debug!(ha_version, "auth required");
            }
            other => return Err(NetworkError::Handshake(format!("{other:?}"))),
        }

        send_message(
            stream,
            &OutgoingMessage::Auth {
                access_token: &self.config.token,
            },
        )
        .await?;

        match recv_message(stream).await? {
            IncomingMessage::AuthOk => Ok(()),
            IncomingMessage::AuthInvalid { message } => Err(NetworkError::AuthInvalid(message)),
            other => Err(NetworkError::Handshake(format!("{other:?}"))),
        }
    }

    async fn subscribe_and_seed(&self, stream: &mut WsStream) -> Result<(), NetworkError> {
        for event_type in [STATE_CHANGED_EVENT, self.config.command_event.as_str()] {
            let id = self.next_id();
            send_message(stream, &OutgoingMessage::SubscribeEvents { id, event_type }).await?;
        }

        let seed_id = self.next_id();
        send_message(stream, &OutgoingMessage::GetStates { id: seed_id }).await?;

        loop {
            match recv_message(stream).await? {
                IncomingMessage::Result {
                    id,
                    success,
                    result,
                } if id == seed_id => {
                    if !success {
                        return Err(NetworkError::Handshake("get_states failed".to_string()));
                    }
                    match activity_from_states(&result, &self.config.activity_entity) {
                        Some(activity) => {
                            info!(activity = activity.as_str(), "activity seeded");
                            self.apply_activity(activity);
                        }
                        None => warn!(
                            entity = self.config.activity_entity.as_str(),
                            "activity entity missing from seed"
                        ),
                    }
                    return Ok(());
                }
                // Subscription acks and early pushes are superseded by the seed.
                other => debug!(?other, "ignored message while seeding"),
            }
        }
    }

    /// Any inbound frame counts as a heartbeat answer; a ping left unanswered
    /// for a whole interval tears the link down.
    async fn receive_loop(&self, mut reader: WsReader, lost: &Notify) -> Result<(), NetworkError> {
        let heartbeat_every = self.config.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                message = reader.next() => {
                    if let Some(Ok(_)) = &message {
                        awaiting_pong = false;
                    }
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .as_ref()
                                .map(|close| close.reason.to_string())
                                .filter(|reason| !reason.trim().is_empty())
                                .unwrap_or_else(|| "remote closed".to_string());
                            return Err(NetworkError::Closed(reason));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(NetworkError::WebSocketReceive(err.to_string())),
                        None => return Err(NetworkError::Closed("stream ended".to_string())),
                    }
                }
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        warn!("heartbeat unanswered; dropping link");
                        return Err(NetworkError::Timeout("heartbeat"));
                    }
                    self.write_frame(Message::Ping(Default::default()))
                        .await
                        .map_err(NetworkError::WebSocketSend)?;
                    awaiting_pong = true;
                }
                _ = lost.notified() => {
                    return Err(NetworkError::WebSocketSend("outbound write failed".to_string()));
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<IncomingMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!("failed to parse backend message: {err}; payload={text}");
                return;
            }
        };

        let IncomingMessage::Event { event } = message else {
            return;
        };

        if event.event_type == STATE_CHANGED_EVENT {
            if let Some(activity) = activity_from_change(&event.data, &self.config.activity_entity)
            {
                self.apply_activity(activity);
            }
        } else if event.event_type == self.config.command_event {
            if event.data.get("dest").and_then(Value::as_str) != Some(INBOUND_DEST) {
                return;
            }
            self.forward_command(&event.data).await;
        }
    }

    async fn forward_command(&self, data: &Value) {
        let command = match Command::from_event_data(data) {
            Ok(Some(command)) => command,
            Ok(None) => {
                debug!(text = ?data.get("text"), "ignoring unknown command");
                return;
            }
            Err(err) => {
                warn!("dropping command: {err}");
                self.metrics.lock().await.record_command_drop(1);
                return;
            }
        };

        info!(?command, "command received");
        if let Err(err) = self.commands.try_send(command) {
            warn!("command queue unavailable, dropping command: {err}");
            self.metrics.lock().await.record_command_drop(1);
        }
    }

    fn apply_activity(&self, activity: String) {
        self.health.set_activity(Some(activity.clone()));
        self.resolver.set_activity(Some(activity));
    }

    pub async fn send(&self, event: OutboundEvent) -> Delivery {
        if self.state() != SessionState::Subscribed {
            return Delivery::dropped(DropReason::NotConnected);
        }

        let mut event_data = Map::new();
        event_data.insert("dest".to_string(), Value::from(OUTBOUND_DEST));
        event_data.insert("text".to_string(), Value::from(event.text));
        event_data.extend(event.extras);

        let payload = OutgoingMessage::FireEvent {
            id: self.next_id(),
            event_type: &self.config.command_event,
            event_data: Value::Object(event_data),
        };
        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(err) => return Delivery::dropped(DropReason::Encode(err.to_string())),
        };

        match timeout(self.config.send_timeout, self.write_frame(Message::Text(text.into()))).await
        {
            Ok(Ok(())) => Delivery::delivered(),
            Ok(Err(reason)) if reason.is_empty() => Delivery::dropped(DropReason::NotConnected),
            Ok(Err(reason)) => Delivery::dropped(DropReason::Transport(reason)),
            Err(_) => {
                warn!("backend send timed out; dropping link");
                self.drop_link().await;
                Delivery::dropped(DropReason::Timeout)
            }
        }
    }

    /// Writes one frame on the live link. A failed write tears the link down.
    /// The error is empty when there was no link.
    async fn write_frame(&self, message: Message) -> Result<(), String> {
        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return Err(String::new());
        };

        match link.writer.send(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("websocket write failed, dropping link: {err}");
                if let Some(link) = guard.take() {
                    link.lost.notify_one();
                }
                Err(err.to_string())
            }
        }
    }

    async fn drop_link(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.lost.notify_one();
        }
    }

    async fn on_disconnected(&self, reason: &str) {
        self.link.lock().await.take();
        self.set_state(SessionState::Disconnected);
        self.health.update_backend(|backend| {
            backend.mark_disconnected();
            backend.record_failure(reason);
        });
    }

    /// Best-effort close frame. The session task is expected to be stopped first.
    pub async fn close(&self) -> Result<(), NetworkError> {
        let link = self.link.lock().await.take();
        self.set_state(SessionState::Disconnected);
        self.health.update_backend(|backend| backend.mark_disconnected());

        let Some(mut link) = link else {
            return Ok(());
        };
        match timeout(self.config.send_timeout, link.writer.send(Message::Close(None))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if is_expected_close_error(&err) => Ok(()),
            Ok(Err(err)) => Err(NetworkError::WebSocketClose(err.to_string())),
            Err(_) => Err(NetworkError::Timeout("close")),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "backend session state");
        }
    }
}

impl EventSink for BackendSession {
    fn send_event(&self, event: OutboundEvent) -> impl Future<Output = Delivery> + Send {
        self.send(event)
    }
}

async fn send_message(
    stream: &mut WsStream,
    message: &OutgoingMessage<'_>,
) -> Result<(), NetworkError> {
    let text =
        serde_json::to_string(message).map_err(|err| NetworkError::Serialize(err.to_string()))?;
    stream
        .send(Message::Text(text.into()))
        .await
        .map_err(|err| NetworkError::WebSocketSend(err.to_string()))
}

async fn recv_message(stream: &mut WsStream) -> Result<IncomingMessage, NetworkError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|err| NetworkError::Handshake(format!("{err}; payload={text}")));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(NetworkError::Closed("closed during handshake".to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(NetworkError::WebSocketReceive(err.to_string())),
        }
    }
}

fn activity_from_states(states: &Value, entity: &str) -> Option<String> {
    states
        .as_array()?
        .iter()
        .find(|state| state.get("entity_id").and_then(Value::as_str) == Some(entity))
        .and_then(|state| state.get("state"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|state| !state.is_empty())
        .map(str::to_string)
}

fn activity_from_change(data: &Value, entity: &str) -> Option<String> {
    let changed = data
        .get("entity_id")
        .or_else(|| data.get("old_state")?.get("entity_id"))
        .and_then(Value::as_str);
    if changed != Some(entity) {
        return None;
    }

    data.get("new_state")?
        .get("state")?
        .as_str()
        .map(str::trim)
        .filter(|state| !state.is_empty())
        .map(str::to_string)
}

fn is_expected_close_error(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::AlreadyClosed | tungstenite::Error::ConnectionClosed
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::dispatch::Command;
    use crate::hid::HidUsage;
    use crate::keymap::Keymap;
    use crate::metrics::RuntimeMetrics;
    use crate::network::BackoffConfig;
    use crate::timing::KeyTiming;

    type ServerStream = WebSocketStream<TcpStream>;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        session: Arc<BackendSession>,
        resolver: Arc<KeymapResolver>,
        health: Arc<HealthAggregator>,
        commands: mpsc::Receiver<Command>,
    }

    fn fixture(url: String, token: &str) -> Fixture {
        fixture_with_heartbeat(url, token, SessionConfig::default().heartbeat)
    }

    fn fixture_with_heartbeat(url: String, token: &str, heartbeat: Duration) -> Fixture {
        let resolver = Arc::new(KeymapResolver::new(Keymap::default(), KeyTiming::default()));
        let health = Arc::new(HealthAggregator::new());
        let (command_tx, commands) = mpsc::channel(8);
        let config = SessionConfig {
            url,
            token: token.to_string(),
            backoff: BackoffConfig {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(50),
            },
            heartbeat,
            ..SessionConfig::default()
        };
        let session = Arc::new(BackendSession::new(
            config,
            Arc::clone(&resolver),
            Arc::clone(&health),
            RuntimeMetrics::shared(),
            command_tx,
        ));
        Fixture {
            session,
            resolver,
            health,
            commands,
        }
    }

    async fn server_send(stream: &mut ServerStream, value: Value) {
        stream
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("server send");
    }

    async fn server_recv(stream: &mut ServerStream) -> Value {
        loop {
            match stream.next().await.expect("client message").expect("frame") {
                Message::Text(text) => return serde_json::from_str(&text).expect("client json"),
                _ => continue,
            }
        }
    }

    /// Runs the server side of the handshake and seeds `activity`.
    async fn accept_and_seed(listener: &TcpListener, activity: &str) -> ServerStream {
        accept_and_seed_after(listener, activity, &[]).await
    }

    /// Like [`accept_and_seed`], but sends `interleaved` between the
    /// `get_states` request and its result.
    async fn accept_and_seed_after(
        listener: &TcpListener,
        activity: &str,
        interleaved: &[Value],
    ) -> ServerStream {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut stream = accept_async(tcp).await.expect("websocket upgrade");

        server_send(&mut stream, json!({"type": "auth_required", "ha_version": "2024.6"})).await;
        let auth = server_recv(&mut stream).await;
        assert_eq!(auth, json!({"type": "auth", "access_token": "secret"}));
        server_send(&mut stream, json!({"type": "auth_ok"})).await;

        let first = server_recv(&mut stream).await;
        assert_eq!(first["type"], "subscribe_events");
        assert_eq!(first["event_type"], "state_changed");
        let second = server_recv(&mut stream).await;
        assert_eq!(second["event_type"], "pihub.cmd");
        server_send(&mut stream, json!({"id": first["id"], "type": "result", "success": true})).await;

        let seed = server_recv(&mut stream).await;
        assert_eq!(seed["type"], "get_states");
        for message in interleaved {
            server_send(&mut stream, message.clone()).await;
        }
        server_send(
            &mut stream,
            json!({
                "id": seed["id"],
                "type": "result",
                "success": true,
                "result": [
                    {"entity_id": "light.lounge", "state": "on"},
                    {"entity_id": "input_select.activity", "state": activity}
                ]
            }),
        )
        .await;
        stream
    }

    async fn wait_subscribed(session: &BackendSession) {
        let mut state = session.subscribe_state();
        timeout(WAIT, state.wait_for(|state| *state == SessionState::Subscribed))
            .await
            .expect("subscribed in time")
            .expect("state sender alive");
    }

    #[test]
    fn incoming_messages_parse() {
        let auth: IncomingMessage =
            serde_json::from_str(r#"{"type":"auth_ok","ha_version":"2024.6"}"#).expect("auth_ok");
        assert!(matches!(auth, IncomingMessage::AuthOk));

        let event: IncomingMessage = serde_json::from_str(
            r#"{"id":2,"type":"event","event":{"event_type":"pihub.cmd","data":{"dest":"pi"}}}"#,
        )
        .expect("event");
        assert!(matches!(
            event,
            IncomingMessage::Event { event } if event.event_type == "pihub.cmd"
        ));

        let pong: IncomingMessage = serde_json::from_str(r#"{"id":9,"type":"pong"}"#).expect("pong");
        assert!(matches!(pong, IncomingMessage::Unknown));
    }

    #[test]
    fn state_changes_are_filtered_by_entity() {
        let change = json!({
            "entity_id": "input_select.activity",
            "new_state": {"state": " listen "}
        });
        assert_eq!(
            activity_from_change(&change, "input_select.activity").as_deref(),
            Some("listen")
        );
        assert_eq!(activity_from_change(&change, "input_select.other"), None);

        let via_old_state = json!({
            "old_state": {"entity_id": "input_select.activity"},
            "new_state": {"state": "watch"}
        });
        assert_eq!(
            activity_from_change(&via_old_state, "input_select.activity").as_deref(),
            Some("watch")
        );
    }

    #[tokio::test]
    async fn send_while_disconnected_returns_immediately() {
        let fixture = fixture("ws://127.0.0.1:9".to_string(), "secret");
        let started = std::time::Instant::now();

        let delivery = fixture
            .session
            .send(OutboundEvent {
                text: "select".to_string(),
                extras: Map::new(),
            })
            .await;

        assert_eq!(delivery, Delivery::dropped(DropReason::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn missing_token_fails_permanently() {
        let fixture = fixture("ws://127.0.0.1:9".to_string(), "  ");
        let result = Arc::clone(&fixture.session).run().await;

        assert!(matches!(result, Err(NetworkError::MissingToken)));
        assert_eq!(fixture.session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn seeds_activity_and_delivers_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let fixture = fixture(url, "secret");
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        let mut server = accept_and_seed(&listener, "watch").await;
        wait_subscribed(&fixture.session).await;
        assert_eq!(fixture.resolver.activity().as_deref(), Some("watch"));
        assert!(fixture.health.snapshot().ws_connected);

        let mut extras = Map::new();
        extras.insert("room".to_string(), json!("lounge"));
        let delivery = fixture
            .session
            .send(OutboundEvent {
                text: "select".to_string(),
                extras,
            })
            .await;
        assert!(delivery.delivered);

        let fired = server_recv(&mut server).await;
        assert_eq!(fired["type"], "fire_event");
        assert_eq!(fired["event_type"], "pihub.cmd");
        assert_eq!(
            fired["event_data"],
            json!({"dest": "ha", "text": "select", "room": "lounge"})
        );

        task.abort();
    }

    #[tokio::test]
    async fn pushes_update_activity_and_forward_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let mut fixture = fixture(url, "secret");
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        let mut server = accept_and_seed(&listener, "watch").await;
        wait_subscribed(&fixture.session).await;
        let mut activity = fixture.resolver.subscribe();

        server_send(
            &mut server,
            json!({"id": 1, "type": "event", "event": {
                "event_type": "state_changed",
                "data": {"entity_id": "input_select.activity", "new_state": {"state": "listen"}}
            }}),
        )
        .await;
        timeout(
            WAIT,
            activity.wait_for(|active| active.activity.as_deref() == Some("listen")),
        )
        .await
        .expect("activity pushed in time")
        .expect("resolver alive");

        // Commands for other destinations are ignored.
        server_send(
            &mut server,
            json!({"id": 2, "type": "event", "event": {
                "event_type": "pihub.cmd",
                "data": {"dest": "ha", "text": "ble_key", "usage": "consumer", "code": "mute"}
            }}),
        )
        .await;
        server_send(
            &mut server,
            json!({"id": 2, "type": "event", "event": {
                "event_type": "pihub.cmd",
                "data": {"dest": "pi", "text": "ble_key", "usage": "consumer", "code": "volume_up", "hold_ms": 100}
            }}),
        )
        .await;

        let command = timeout(WAIT, fixture.commands.recv())
            .await
            .expect("command in time")
            .expect("command queue open");
        assert_eq!(
            command,
            Command::BleKey {
                usage: HidUsage::Consumer,
                code: "volume_up".to_string(),
                hold: Duration::from_millis(100),
            }
        );

        task.abort();
    }

    #[tokio::test]
    async fn rejected_auth_is_retried_with_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let fixture = fixture(url, "secret");
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut stream = accept_async(tcp).await.expect("websocket upgrade");
            server_send(&mut stream, json!({"type": "auth_required"})).await;
            server_recv(&mut stream).await;
            server_send(&mut stream, json!({"type": "auth_invalid", "message": "bad token"})).await;
        }

        let _server = accept_and_seed(&listener, "listen").await;
        wait_subscribed(&fixture.session).await;

        let backend = fixture.health.snapshot().backend;
        assert!(backend.connected);
        assert_eq!(backend.consecutive_failures, 0);
        assert!(
            backend
                .last_error
                .as_deref()
                .is_some_and(|error| error.contains("bad token"))
        );

        task.abort();
    }

    #[tokio::test]
    async fn lost_connection_drops_sends_until_resubscribed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let fixture = fixture(url, "secret");
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        let server = accept_and_seed(&listener, "watch").await;
        wait_subscribed(&fixture.session).await;
        drop(server);

        let mut state = fixture.session.subscribe_state();
        timeout(WAIT, state.wait_for(|state| *state != SessionState::Subscribed))
            .await
            .expect("disconnect noticed")
            .expect("state sender alive");
        let delivery = fixture
            .session
            .send(OutboundEvent {
                text: "select".to_string(),
                extras: Map::new(),
            })
            .await;
        assert!(!delivery.delivered);

        let _server = accept_and_seed(&listener, "watch").await;
        wait_subscribed(&fixture.session).await;

        task.abort();
    }

    #[tokio::test]
    async fn seed_wins_over_pushes_received_while_seeding() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let mut fixture = fixture(url, "secret");
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        let early_push = json!({"id": 1, "type": "event", "event": {
            "event_type": "state_changed",
            "data": {"entity_id": "input_select.activity", "new_state": {"state": "listen"}}
        }});
        let early_command = json!({"id": 2, "type": "event", "event": {
            "event_type": "pihub.cmd",
            "data": {"dest": "pi", "text": "ble_key", "usage": "consumer", "code": "mute"}
        }});
        let _server =
            accept_and_seed_after(&listener, "watch", &[early_push, early_command]).await;
        wait_subscribed(&fixture.session).await;

        assert_eq!(fixture.resolver.activity().as_deref(), Some("watch"));
        assert_eq!(fixture.resolver.snapshot().version, 1);
        assert!(fixture.commands.try_recv().is_err());

        task.abort();
    }

    #[tokio::test]
    async fn failed_heartbeat_write_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let fixture = fixture_with_heartbeat(url, "secret", Duration::from_millis(50));
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        let _server = accept_and_seed(&listener, "watch").await;
        wait_subscribed(&fixture.session).await;

        // A closed writer refuses every later frame, including the next ping.
        {
            let mut link = fixture.session.link.lock().await;
            let link = link.as_mut().expect("live link");
            let _ = link.writer.close().await;
        }

        let _server = timeout(WAIT, accept_and_seed(&listener, "watch"))
            .await
            .expect("reconnected after heartbeat failure");
        wait_subscribed(&fixture.session).await;
        assert!(fixture.health.snapshot().backend.last_error.is_some());

        task.abort();
    }

    #[tokio::test]
    async fn unanswered_heartbeat_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let fixture = fixture_with_heartbeat(url, "secret", Duration::from_millis(50));
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        // The server never reads again, so pings are never answered.
        let _silent = accept_and_seed(&listener, "watch").await;
        wait_subscribed(&fixture.session).await;

        let _server = timeout(WAIT, accept_and_seed(&listener, "watch"))
            .await
            .expect("reconnected after missed pong");
        wait_subscribed(&fixture.session).await;
        assert!(
            fixture
                .health
                .snapshot()
                .backend
                .last_error
                .as_deref()
                .is_some_and(|error| error.contains("heartbeat"))
        );

        task.abort();
    }

    #[tokio::test]
    async fn answered_heartbeat_keeps_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let fixture = fixture_with_heartbeat(url, "secret", Duration::from_millis(50));
        let task = tokio::spawn(Arc::clone(&fixture.session).run());

        let mut server = accept_and_seed(&listener, "watch").await;
        wait_subscribed(&fixture.session).await;

        // Reading lets the server answer each ping with a pong.
        let mut pings = 0;
        let _ = timeout(Duration::from_millis(400), async {
            while let Some(Ok(message)) = server.next().await {
                if matches!(message, Message::Ping(_)) {
                    pings += 1;
                }
            }
        })
        .await;

        assert!(pings >= 3);
        assert_eq!(fixture.session.state(), SessionState::Subscribed);

        task.abort();
    }
}
