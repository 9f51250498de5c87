pub mod backoff;
pub mod ha_client;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub use backoff::Backoff;
pub use ha_client::BackendSession;

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8123/api/websocket";
const DEFAULT_ACTIVITY_ENTITY: &str = "input_select.activity";
const DEFAULT_COMMAND_EVENT: &str = "pihub.cmd";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("backend token is not configured")]
    MissingToken,
    #[error("failed to build websocket request: {0}")]
    RequestBuild(String),
    #[error("failed to connect websocket: {0}")]
    ConnectFailed(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("unexpected handshake message: {0}")]
    Handshake(String),
    #[error("authentication rejected: {0}")]
    AuthInvalid(String),
    #[error("failed to serialize websocket payload: {0}")]
    Serialize(String),
    #[error("failed to send websocket payload: {0}")]
    WebSocketSend(String),
    #[error("failed to receive websocket payload: {0}")]
    WebSocketReceive(String),
    #[error("websocket closed: {0}")]
    Closed(String),
    #[error("failed to close websocket connection: {0}")]
    WebSocketClose(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Seeding,
    Subscribed,
    /// The session cannot ever succeed, e.g. no token.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub token: String,
    pub activity_entity: String,
    pub command_event: String,
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
    pub heartbeat: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            token: String::new(),
            activity_entity: DEFAULT_ACTIVITY_ENTITY.to_string(),
            command_event: DEFAULT_COMMAND_EVENT.to_string(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        }
    }
}
