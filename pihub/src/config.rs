use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::network::{BackoffConfig, SessionConfig};
use crate::timing::{
    DEFAULT_LONG_PRESS_MS, DEFAULT_REPEAT_INITIAL_MS, DEFAULT_REPEAT_RATE_MS, KeyTiming,
    RepeatConfig,
};

const DEFAULT_HA_WS_URL: &str = "ws://127.0.0.1:8123/api/websocket";
const DEFAULT_HA_TOKEN_FILE: &str = "/run/secrets/ha_token";
const DEFAULT_HA_ACTIVITY: &str = "input_select.activity";
const DEFAULT_HA_CMD_EVENT: &str = "pihub.cmd";
const DEFAULT_BLE_ADAPTER: &str = "hci0";
const DEFAULT_BLE_DEVICE_NAME: &str = "PiHub Remote";
const DEFAULT_HEALTH_HOST: &str = "0.0.0.0";
const DEFAULT_HEALTH_PORT: u16 = 9123;
const SYSTEM_KEYMAP_PATH: &str = "/etc/pihub/keymap.json";
const BUNDLED_KEYMAP_PATH: &str = "assets/keymap.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("token unavailable: set HA_TOKEN or provide HA_TOKEN_FILE")]
    TokenUnavailable,
    #[error("token file not found: {0}")]
    TokenFileMissing(PathBuf),
    #[error("failed to read token file {path}: {reason}")]
    TokenFileRead { path: PathBuf, reason: String },
    #[error("token file {0} is empty")]
    TokenFileEmpty(PathBuf),
}

/// Process settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub ha_ws_url: String,
    pub ha_token_file: Option<PathBuf>,
    pub ha_activity: String,
    pub ha_cmd_event: String,
    pub usb_device: Option<PathBuf>,
    pub usb_grab: bool,
    pub keymap_path: Option<PathBuf>,
    pub ble_adapter: String,
    pub ble_device_name: String,
    pub health_host: String,
    pub health_port: u16,
    pub repeat_initial_ms: u64,
    pub repeat_rate_ms: u64,
    pub long_press_ms: u64,
    pub debug: bool,
    env_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads only `DEBUG`, so logging can start before the rest is parsed.
    pub fn debug_from_env() -> bool {
        debug_enabled(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let text_or =
            |name: &str, default: &str| text(name).unwrap_or_else(|| default.to_string());
        let path = |name: &str| text(name).map(PathBuf::from);

        Self {
            ha_ws_url: text_or("HA_WS_URL", DEFAULT_HA_WS_URL),
            ha_token_file: match lookup("HA_TOKEN_FILE") {
                Some(value) => Some(value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .map(PathBuf::from),
                None => Some(PathBuf::from(DEFAULT_HA_TOKEN_FILE)),
            },
            ha_activity: text_or("HA_ACTIVITY", DEFAULT_HA_ACTIVITY),
            ha_cmd_event: text_or("HA_CMD_EVENT", DEFAULT_HA_CMD_EVENT),
            usb_device: path("USB_DEVICE"),
            usb_grab: parse_bool(text("USB_GRAB"), true),
            keymap_path: path("KEYMAP_PATH"),
            ble_adapter: text_or("BLE_ADAPTER", DEFAULT_BLE_ADAPTER),
            ble_device_name: text_or("BLE_DEVICE_NAME", DEFAULT_BLE_DEVICE_NAME),
            health_host: text_or("HEALTH_HOST", DEFAULT_HEALTH_HOST),
            health_port: parse_number("HEALTH_PORT", text("HEALTH_PORT"), DEFAULT_HEALTH_PORT),
            repeat_initial_ms: parse_number(
                "REPEAT_INITIAL_MS",
                text("REPEAT_INITIAL_MS"),
                DEFAULT_REPEAT_INITIAL_MS,
            ),
            repeat_rate_ms: parse_positive(
                "REPEAT_RATE_MS",
                text("REPEAT_RATE_MS"),
                DEFAULT_REPEAT_RATE_MS,
            ),
            long_press_ms: parse_positive(
                "LONG_PRESS_MS",
                text("LONG_PRESS_MS"),
                DEFAULT_LONG_PRESS_MS,
            ),
            debug: debug_enabled(&lookup),
            env_token: text("HA_TOKEN"),
        }
    }

    /// The backend token: `HA_TOKEN` wins, then the token file.
    pub fn load_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.env_token {
            return Ok(token.clone());
        }

        let path = self
            .ha_token_file
            .as_deref()
            .ok_or(ConfigError::TokenUnavailable)?;
        read_token_file(path)
    }

    pub fn keymap_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.keymap_path {
            candidates.push(path.clone());
        }
        candidates.push(PathBuf::from(SYSTEM_KEYMAP_PATH));
        candidates.push(PathBuf::from(BUNDLED_KEYMAP_PATH));
        candidates.push(Path::new(env!("CARGO_MANIFEST_DIR")).join(BUNDLED_KEYMAP_PATH));
        candidates
    }

    pub fn repeat(&self) -> RepeatConfig {
        RepeatConfig::new(
            Duration::from_millis(self.repeat_initial_ms),
            Duration::from_millis(self.repeat_rate_ms),
        )
    }

    pub fn key_timing(&self) -> KeyTiming {
        KeyTiming {
            long_press: Duration::from_millis(self.long_press_ms),
            repeat: false,
        }
    }

    pub fn session(&self, token: String) -> SessionConfig {
        SessionConfig {
            url: self.ha_ws_url.clone(),
            token,
            activity_entity: self.ha_activity.clone(),
            command_event: self.ha_cmd_event.clone(),
            backoff: BackoffConfig::default(),
            ..SessionConfig::default()
        }
    }
}

fn read_token_file(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ConfigError::TokenFileMissing(path.to_path_buf())
        } else {
            ConfigError::TokenFileRead {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        }
    })?;

    let token = content.trim();
    if token.is_empty() {
        return Err(ConfigError::TokenFileEmpty(path.to_path_buf()));
    }
    Ok(token.to_string())
}

fn debug_enabled<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    parse_bool(
        lookup("DEBUG").map(|value| value.trim().to_string()),
        false,
    )
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_number<T>(name: &str, value: Option<String>, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = value else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                setting = name,
                value = raw.as_str(),
                %default,
                "invalid numeric setting; using default"
            );
            default
        }
    }
}

fn parse_positive(name: &str, value: Option<String>, default: u64) -> u64 {
    match parse_number(name, value, default) {
        0 => {
            warn!(setting = name, %default, "setting must be positive; using default");
            default
        }
        parsed => parsed,
    }
}
