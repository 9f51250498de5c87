use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::hid::{HidChannel, HidUsage, macros};
use crate::input::EdgeKind;
use crate::metrics::SharedMetrics;
use crate::utils::{json_ms, millis};

pub const DEFAULT_MS_WHITELIST: &[u64] = &[
    20, 40, 60, 80, 100, 120, 150, 200, 250, 300, 500, 800, 1000, 1500, 2000,
];
/// The default list plus the 400 ms macro gap.
pub const INTER_DELAY_MS_WHITELIST: &[u64] = &[
    20, 40, 60, 80, 100, 120, 150, 200, 250, 300, 400, 500, 800, 1000, 1500, 2000,
];
const CHANNEL_QUEUE_CAPACITY: usize = 64;
const DROP_WARN_EVERY: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("channel not connected")]
    NotConnected,
    #[error("send timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("unknown {usage:?} usage code `{code}`")]
    UnknownUsage { usage: HidUsage, code: String },
    #[error("unknown macro `{0}`")]
    UnknownMacro(String),
    #[error("macro aborted after {sent} of {total} steps")]
    MacroAborted { sent: usize, total: usize },
}

/// Result of a single channel send. Dropped sends are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: bool,
    pub reason: Option<DropReason>,
}

impl Delivery {
    pub fn delivered() -> Self {
        Self {
            delivered: true,
            reason: None,
        }
    }

    pub fn dropped(reason: DropReason) -> Self {
        Self {
            delivered: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Backend,
    Hid,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Emit {
        text: String,
        extras: Map<String, Value>,
    },
    /// Edge-accurate press or release, mirroring the physical key.
    HidEdge {
        usage: HidUsage,
        code: String,
        edge: EdgeKind,
    },
    /// Press now, release after `hold`.
    HidTap {
        usage: HidUsage,
        code: String,
        hold: Duration,
    },
    Macro {
        name: String,
        tap: Duration,
        inter_delay: Duration,
    },
}

impl Action {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Emit { .. } => Channel::Backend,
            Self::HidEdge { .. } | Self::HidTap { .. } | Self::Macro { .. } => Channel::Hid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub text: String,
    pub extras: Map<String, Value>,
}

/// Non-blocking outbound send to the backend.
pub trait EventSink: Send + Sync + 'static {
    fn send_event(&self, event: OutboundEvent) -> impl Future<Output = Delivery> + Send;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command is missing `{0}`")]
    MissingField(&'static str),
    #[error("unknown usage `{0}`")]
    InvalidUsage(String),
    #[error("invalid millisecond value for `{field}`: {value}")]
    InvalidMs { field: &'static str, value: String },
}

/// Commands pushed by the backend, bypassing the keymap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    BleKey {
        usage: HidUsage,
        code: String,
        hold: Duration,
    },
    Macro {
        name: String,
        tap: Duration,
        inter_delay: Duration,
    },
}

impl Command {
    /// Parses the `data` of a command event. Unknown `text` values yield `Ok(None)`.
    pub fn from_event_data(data: &Value) -> Result<Option<Self>, CommandError> {
        let text = data.get("text").and_then(Value::as_str).unwrap_or_default();
        match text {
            "ble_key" => {
                let usage = data
                    .get("usage")
                    .and_then(Value::as_str)
                    .ok_or(CommandError::MissingField("usage"))?;
                let usage = HidUsage::parse(usage)
                    .ok_or_else(|| CommandError::InvalidUsage(usage.to_string()))?;
                let code = data
                    .get("code")
                    .and_then(Value::as_str)
                    .filter(|code| !code.is_empty())
                    .ok_or(CommandError::MissingField("code"))?;
                let hold = whitelisted_ms(
                    data.get("hold_ms"),
                    "hold_ms",
                    DEFAULT_MS_WHITELIST,
                    macros::DEFAULT_TAP_MS,
                )?;

                Ok(Some(Self::BleKey {
                    usage,
                    code: code.to_string(),
                    hold,
                }))
            }
            "macro" => {
                let name = data
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|name| !name.is_empty())
                    .ok_or(CommandError::MissingField("name"))?;
                let tap = whitelisted_ms(
                    data.get("tap_ms"),
                    "tap_ms",
                    DEFAULT_MS_WHITELIST,
                    macros::DEFAULT_TAP_MS,
                )?;
                let inter_delay = whitelisted_ms(
                    data.get("inter_delay_ms"),
                    "inter_delay_ms",
                    INTER_DELAY_MS_WHITELIST,
                    macros::DEFAULT_INTER_DELAY_MS,
                )?;

                Ok(Some(Self::Macro {
                    name: name.to_string(),
                    tap,
                    inter_delay,
                }))
            }
            _ => Ok(None),
        }
    }
}

impl From<Command> for Action {
    fn from(command: Command) -> Self {
        match command {
            Command::BleKey { usage, code, hold } => Self::HidTap { usage, code, hold },
            Command::Macro {
                name,
                tap,
                inter_delay,
            } => Self::Macro {
                name,
                tap,
                inter_delay,
            },
        }
    }
}

fn whitelisted_ms(
    value: Option<&Value>,
    field: &'static str,
    allowed: &[u64],
    default: u64,
) -> Result<Duration, CommandError> {
    let Some(value) = value.filter(|value| !value.is_null()) else {
        return Ok(Duration::from_millis(default));
    };
    let ms = json_ms(value).ok_or_else(|| CommandError::InvalidMs {
        field,
        value: value.to_string(),
    })?;

    if allowed.contains(&ms) {
        Ok(Duration::from_millis(ms))
    } else {
        warn!(field, ms, default, "non-whitelisted ms value; using default");
        Ok(Duration::from_millis(default))
    }
}

/// Routes resolved actions and backend commands to their channel.
pub struct Dispatcher<S> {
    backend: Arc<S>,
    hid: Arc<HidChannel>,
    metrics: SharedMetrics,
}

impl<S: EventSink> Dispatcher<S> {
    pub fn new(backend: Arc<S>, hid: Arc<HidChannel>, metrics: SharedMetrics) -> Self {
        Self {
            backend,
            hid,
            metrics,
        }
    }

    pub async fn execute(&self, action: Action) -> Delivery {
        match action {
            Action::Emit { text, extras } => {
                let started = Instant::now();
                let delivery = self
                    .backend
                    .send_event(OutboundEvent {
                        text: text.clone(),
                        extras,
                    })
                    .await;
                self.metrics
                    .lock()
                    .await
                    .record_backend_send(delivery.delivered, millis(started.elapsed()));
                if delivery.delivered {
                    debug!(text, "event delivered");
                } else {
                    debug!(text, reason = ?delivery.reason, "event dropped");
                }
                delivery
            }
            Action::HidEdge { usage, code, edge } => {
                let delivery = self.hid.send(usage, &code, edge);
                self.record_ble(&delivery).await;
                delivery
            }
            Action::HidTap { usage, code, hold } => {
                let delivery = self.hid.send(usage, &code, EdgeKind::Down);
                self.record_ble(&delivery).await;
                if delivery.delivered {
                    let hid = Arc::clone(&self.hid);
                    tokio::spawn(async move {
                        sleep(hold).await;
                        let release = hid.send(usage, &code, EdgeKind::Up);
                        if !release.delivered {
                            warn!(?usage, code, reason = ?release.reason, "tap release dropped");
                        }
                    });
                }
                delivery
            }
            Action::Macro {
                name,
                tap,
                inter_delay,
            } => {
                let Some(steps) = macros::lookup(&name) else {
                    warn!(name, "unknown macro");
                    return Delivery::dropped(DropReason::UnknownMacro(name));
                };

                let outcome = self.hid.run_sequence(steps, tap, inter_delay).await;
                let delivery = if outcome.completed() {
                    info!(name, steps = outcome.total, "macro complete");
                    Delivery::delivered()
                } else if outcome.sent == 0 && !self.hid.is_ready() {
                    Delivery::dropped(DropReason::NotConnected)
                } else {
                    Delivery::dropped(DropReason::MacroAborted {
                        sent: outcome.sent,
                        total: outcome.total,
                    })
                };
                self.record_ble(&delivery).await;
                delivery
            }
        }
    }

    async fn record_ble(&self, delivery: &Delivery) {
        self.metrics.lock().await.record_ble(delivery.delivered);
    }

    /// Spawns the dispatch tasks. Keymap actions are routed by channel onto
    /// their own worker, so a stalled backend write never holds up HID
    /// output. Backend commands get a further worker so a long macro never
    /// delays key handling. Each worker runs its input in arrival order.
    pub fn spawn_workers(
        self: Arc<Self>,
        mut action_rx: mpsc::Receiver<Action>,
        mut command_rx: mpsc::Receiver<Command>,
    ) -> DispatchWorkers {
        let (backend_tx, backend_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        let (hid_tx, hid_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);

        let router = {
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                let mut dropped = 0u64;
                while let Some(action) = action_rx.recv().await {
                    let channel = action.channel();
                    let queue = match channel {
                        Channel::Backend => &backend_tx,
                        Channel::Hid => &hid_tx,
                    };
                    if queue.try_send(action).is_err() {
                        dropped += 1;
                        metrics.lock().await.record_action_drop(1);
                        if dropped % DROP_WARN_EVERY == 1 {
                            warn!(?channel, dropped, "channel queue unavailable; dropping action");
                        }
                    }
                }
                debug!("action router stopped");
            })
        };
        let backend = Self::spawn_channel_worker(Arc::clone(&self), backend_rx, Channel::Backend);
        let hid = Self::spawn_channel_worker(Arc::clone(&self), hid_rx, Channel::Hid);

        let commands = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                debug!(?command, "executing backend command");
                self.execute(command.into()).await;
            }
            debug!("command worker stopped");
        });

        DispatchWorkers {
            handles: vec![router, backend, hid, commands],
        }
    }

    fn spawn_channel_worker(
        dispatcher: Arc<Self>,
        mut actions: mpsc::Receiver<Action>,
        channel: Channel,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(action) = actions.recv().await {
                dispatcher.execute(action).await;
            }
            debug!(?channel, "channel worker stopped");
        })
    }
}

/// Handles of the dispatch tasks started by [`Dispatcher::spawn_workers`].
pub struct DispatchWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl DispatchWorkers {
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Waits until every worker has drained its queue after the inputs closed.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!("dispatch worker failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Backend stand-in that records accepted events.
    #[derive(Default)]
    pub struct FakeSink {
        pub connected: AtomicBool,
        events: Mutex<Vec<OutboundEvent>>,
    }

    impl FakeSink {
        pub fn connected() -> Self {
            let sink = Self::default();
            sink.connected.store(true, Ordering::SeqCst);
            sink
        }

        pub fn events(&self) -> Vec<OutboundEvent> {
            self.events.lock().expect("events lock").clone()
        }
    }

    impl EventSink for FakeSink {
        async fn send_event(&self, event: OutboundEvent) -> Delivery {
            if !self.connected.load(Ordering::SeqCst) {
                return Delivery::dropped(DropReason::NotConnected);
            }
            self.events.lock().expect("events lock").push(event);
            Delivery::delivered()
        }
    }
}
