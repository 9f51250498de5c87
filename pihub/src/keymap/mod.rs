//! Activity-dependent key bindings.
//!
//! A keymap document has two parts: `scancode_map`, which names physical keys,
//! and `activities`, which binds logical keys to actions per activity. The
//! activity `"*"` applies whenever the current activity has no binding of its
//! own for a key.

pub mod resolver;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatch::Action;
use crate::hid::{HidUsage, macros, usage_id};
use crate::input::EdgeKind;
use crate::timing::EventKind;
use crate::utils::json_ms;

pub use resolver::{ActiveKeymap, KeymapResolver};

pub const WILDCARD_ACTIVITY: &str = "*";

#[derive(Debug, Error)]
pub enum KeymapError {
    #[error("failed to read keymap {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("keymap schema invalid: {0}")]
    Parse(String),
    #[error("keymap not found; tried {}", format_paths(.0))]
    NotFound(Vec<PathBuf>),
    #[error("keymap entry {activity}/{key}[{index}]: {reason}")]
    Entry {
        activity: String,
        key: String,
        index: usize,
        reason: String,
    },
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Down,
    Up,
    LongPress,
}

impl Trigger {
    fn event(self) -> EventKind {
        match self {
            Self::Down => EventKind::Down,
            Self::Up => EventKind::Up,
            Self::LongPress => EventKind::LongPress,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryAction {
    Emit {
        text: String,
        extras: Map<String, Value>,
    },
    Ble {
        usage: HidUsage,
        code: String,
        hold: Option<Duration>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeymapEntry {
    pub trigger: Trigger,
    pub action: EntryAction,
    pub long_press: Option<Duration>,
    pub repeat: bool,
}

impl KeymapEntry {
    pub fn responds_to(&self, kind: EventKind) -> bool {
        match &self.action {
            EntryAction::Emit { .. } => {
                kind == self.trigger.event()
                    || (kind == EventKind::Repeat && self.repeat && self.trigger == Trigger::Down)
            }
            EntryAction::Ble { hold: None, .. } if self.trigger == Trigger::Down => {
                matches!(kind, EventKind::Down | EventKind::Up)
            }
            EntryAction::Ble { .. } => kind == self.trigger.event(),
        }
    }

    pub fn action_for(&self, kind: EventKind) -> Option<Action> {
        if !self.responds_to(kind) {
            return None;
        }

        let action = match &self.action {
            EntryAction::Emit { text, extras } => Action::Emit {
                text: text.clone(),
                extras: extras.clone(),
            },
            EntryAction::Ble {
                usage,
                code,
                hold: None,
            } if self.trigger == Trigger::Down => Action::HidEdge {
                usage: *usage,
                code: code.clone(),
                edge: if kind == EventKind::Up {
                    EdgeKind::Up
                } else {
                    EdgeKind::Down
                },
            },
            EntryAction::Ble { usage, code, hold } => Action::HidTap {
                usage: *usage,
                code: code.clone(),
                hold: hold.unwrap_or(Duration::from_millis(macros::DEFAULT_TAP_MS)),
            },
        };
        Some(action)
    }
}

#[derive(Deserialize)]
struct KeymapDocument {
    scancode_map: HashMap<String, String>,
    activities: HashMap<String, HashMap<String, Vec<Value>>>,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "do")]
    kind: String,
    #[serde(default)]
    when: Trigger,
    #[serde(default)]
    repeat: bool,
    long_press_ms: Option<Value>,
    min_hold_ms: Option<Value>,
    text: Option<String>,
    /// Everything else: the event payload for `emit`, the HID fields for `ble`.
    #[serde(flatten)]
    extras: Map<String, Value>,
}

impl RawEntry {
    fn into_entry(self, location: &str) -> Result<KeymapEntry, String> {
        let long_press = match (&self.long_press_ms, &self.min_hold_ms) {
            (Some(value), _) => optional_ms(Some(value), location, "long_press_ms"),
            (None, value) => optional_ms(value.as_ref(), location, "min_hold_ms"),
        };

        let action = match self.kind.as_str() {
            "emit" => {
                let text = self
                    .text
                    .filter(|text| !text.is_empty())
                    .ok_or("emit entry needs a non-empty `text`")?;
                EntryAction::Emit {
                    text,
                    extras: self.extras,
                }
            }
            "ble" => {
                let usage = match self.extras.get("usage") {
                    Some(Value::String(usage)) => HidUsage::parse(usage)
                        .ok_or_else(|| format!("unknown usage `{usage}`"))?,
                    Some(other) => return Err(format!("`usage` must be a string, got {other}")),
                    None => return Err("ble entry needs `usage`".to_string()),
                };
                let code = match self.extras.get("code") {
                    Some(Value::String(code)) if !code.is_empty() => code.clone(),
                    _ => return Err("ble entry needs `code`".to_string()),
                };
                if usage_id(usage, &code).is_none() {
                    return Err(format!("unknown {usage:?} code `{code}`"));
                }
                if self.repeat {
                    return Err("ble entries never repeat".to_string());
                }
                EntryAction::Ble {
                    usage,
                    code,
                    hold: optional_ms(self.extras.get("hold_ms"), location, "hold_ms"),
                }
            }
            "macro" => {
                return Err(
                    "macros are backend commands and cannot be bound in a keymap".to_string(),
                );
            }
            other => return Err(format!("unknown do `{other}`")),
        };

        if self.repeat && self.when != Trigger::Down {
            return Err("`repeat` requires `when: down`".to_string());
        }

        Ok(KeymapEntry {
            trigger: self.when,
            action,
            long_press,
            repeat: self.repeat,
        })
    }
}

fn optional_ms(value: Option<&Value>, location: &str, field: &str) -> Option<Duration> {
    let value = value.filter(|value| !value.is_null())?;
    match json_ms(value) {
        Some(ms) => Some(Duration::from_millis(ms)),
        None => {
            warn!(location, field, %value, "invalid ms value in keymap; ignoring");
            None
        }
    }
}

/// Immutable binding table, replaced as a whole.
#[derive(Debug, Clone, Default)]
pub struct Keymap {
    scancode_map: HashMap<String, String>,
    activities: HashMap<String, HashMap<String, Vec<KeymapEntry>>>,
}

impl Keymap {
    pub fn from_json(text: &str) -> Result<Self, KeymapError> {
        let document: Value =
            serde_json::from_str(text).map_err(|err| KeymapError::Parse(err.to_string()))?;
        let document: KeymapDocument = serde_json::from_value(document).map_err(|err| {
            KeymapError::Parse(format!(
                "expected `scancode_map` and `activities` objects: {err}"
            ))
        })?;

        let mut activities = HashMap::with_capacity(document.activities.len());
        for (activity, bindings) in document.activities {
            let mut keys = HashMap::with_capacity(bindings.len());
            for (key, raw_entries) in bindings {
                let entries = parse_entries(&activity, &key, raw_entries)?;
                keys.insert(key, entries);
            }
            activities.insert(activity, keys);
        }

        Ok(Self {
            scancode_map: document.scancode_map,
            activities,
        })
    }

    pub fn load(path: &Path) -> Result<Self, KeymapError> {
        let text = std::fs::read_to_string(path).map_err(|err| KeymapError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Loads the first candidate that exists.
    pub fn load_first(candidates: &[PathBuf]) -> Result<(PathBuf, Self), KeymapError> {
        let path = candidates
            .iter()
            .find(|path| path.is_file())
            .ok_or_else(|| KeymapError::NotFound(candidates.to_vec()))?;
        let keymap = Self::load(path)?;
        info!(
            path = %path.display(),
            activities = keymap.activities.len(),
            scancodes = keymap.scancode_map.len(),
            "keymap loaded"
        );
        Ok((path.clone(), keymap))
    }

    pub fn scancode_map(&self) -> &HashMap<String, String> {
        &self.scancode_map
    }

    /// Bindings for `key` under `activity`, falling back to the wildcard activity.
    pub fn entries(&self, activity: &str, key: &str) -> &[KeymapEntry] {
        [activity, WILDCARD_ACTIVITY]
            .into_iter()
            .filter_map(|name| self.activities.get(name)?.get(key))
            .find(|entries| !entries.is_empty())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn parse_entries(
    activity: &str,
    key: &str,
    raw_entries: Vec<Value>,
) -> Result<Vec<KeymapEntry>, KeymapError> {
    let location = format!("{activity}/{key}");
    let entry_error = |index: usize, reason: String| KeymapError::Entry {
        activity: activity.to_string(),
        key: key.to_string(),
        index,
        reason,
    };

    let mut entries: Vec<KeymapEntry> = Vec::with_capacity(raw_entries.len());
    for (index, value) in raw_entries.into_iter().enumerate() {
        if !value.is_object() {
            return Err(entry_error(index, "must be an object".to_string()));
        }
        let raw: RawEntry =
            serde_json::from_value(value).map_err(|err| entry_error(index, err.to_string()))?;
        let entry = raw
            .into_entry(&location)
            .map_err(|reason| entry_error(index, reason))?;

        let overlaps = [
            EventKind::Down,
            EventKind::Up,
            EventKind::LongPress,
            EventKind::Repeat,
        ]
        .into_iter()
        .any(|kind| {
            entry.responds_to(kind) && entries.iter().any(|other| other.responds_to(kind))
        });
        if overlaps {
            return Err(entry_error(
                index,
                "overlaps an earlier entry for the same key".to_string(),
            ));
        }
        entries.push(entry);
    }
    Ok(entries)
}
