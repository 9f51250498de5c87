use thiserror::Error;

use crate::config::ConfigError;
use crate::keymap::KeymapError;
use crate::network::NetworkError;

/// Fatal startup and shutdown failures surfaced by [`crate::run`].
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
    #[error("cannot start without backend credentials: {0}")]
    Credentials(#[from] ConfigError),
    #[error("keymap unusable: {0}")]
    Keymap(#[from] KeymapError),
    #[error("backend session stopped: {0}")]
    Backend(#[from] NetworkError),
    #[error("runtime error: {0}")]
    Runtime(String),
}
