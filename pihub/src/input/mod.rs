pub mod normalizer;
pub mod reader;

use std::path::PathBuf;

use thiserror::Error;
use tokio::time::Instant;

pub use normalizer::EdgeNormalizer;
pub use reader::{DeviceReader, ReaderConfig};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("no keyboard-like input device found")]
    NoDevice,
    #[error("failed to open input device {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("failed to read from input device: {0}")]
    Read(String),
    #[error("edge consumer dropped")]
    ConsumerClosed,
}

/// Kernel key event value. Anything outside 0..=2 is not a key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValue {
    Release,
    Press,
    Repeat,
}

impl KeyValue {
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Release),
            1 => Some(Self::Press),
            2 => Some(Self::Repeat),
            _ => None,
        }
    }
}

/// One key sample as read from the device, before any filtering.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub code: Option<u16>,
    pub scan: Option<u32>,
    pub value: KeyValue,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Down,
    Up,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Up => "up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub key: String,
    pub kind: EdgeKind,
    pub at: Instant,
}
