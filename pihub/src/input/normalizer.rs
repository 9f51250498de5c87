use std::collections::{HashMap, HashSet};

use evdev::Key;
use tokio::time::Instant;
use tracing::debug;

use crate::input::{Edge, EdgeKind, KeyValue, RawSample};

/// Turns raw key samples into down/up edges on logical keys.
///
/// The scancode map accepts two kinds of keys: kernel key names such as
/// `KEY_LEFT`, and decimal `MSC_SCAN` values such as `"786924"` for remotes
/// that report everything as `KEY_UNKNOWN` plus a scan code. The key name is
/// tried first, the scan code second.
pub struct EdgeNormalizer {
    scancode_map: HashMap<String, String>,
    pressed: HashSet<String>,
    unmapped: u64,
    orphaned: u64,
}

impl EdgeNormalizer {
    pub fn new(scancode_map: HashMap<String, String>) -> Self {
        Self {
            scancode_map,
            pressed: HashSet::new(),
            unmapped: 0,
            orphaned: 0,
        }
    }

    pub fn push(&mut self, sample: RawSample) -> Option<Edge> {
        if sample.value == KeyValue::Repeat {
            return None;
        }

        let Some(key) = self.resolve(sample.code, sample.scan) else {
            self.unmapped += 1;
            debug!(
                code = ?sample.code,
                scan = ?sample.scan,
                "unmapped key sample discarded"
            );
            return None;
        };

        let kind = match sample.value {
            KeyValue::Press => {
                // A second press while held is a repeat in disguise.
                if !self.pressed.insert(key.clone()) {
                    return None;
                }
                EdgeKind::Down
            }
            KeyValue::Release => {
                // Only a key seen going down may go up.
                if !self.pressed.remove(&key) {
                    self.orphaned += 1;
                    debug!(key = key.as_str(), "release without press discarded");
                    return None;
                }
                EdgeKind::Up
            }
            KeyValue::Repeat => return None,
        };

        Some(Edge {
            key,
            kind,
            at: sample.at,
        })
    }

    /// Emits an up edge for every key still held, e.g. after the device went away.
    pub fn release_all(&mut self, at: Instant) -> Vec<Edge> {
        let mut keys: Vec<String> = self.pressed.drain().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| Edge {
                key,
                kind: EdgeKind::Up,
                at,
            })
            .collect()
    }

    pub fn unmapped(&self) -> u64 {
        self.unmapped
    }

    /// Releases discarded because their key was not down.
    pub fn orphaned(&self) -> u64 {
        self.orphaned
    }

    /// Forgets a press whose down edge never left the reader, so the
    /// matching release is discarded too.
    pub fn cancel_press(&mut self, key: &str) {
        self.pressed.remove(key);
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.pressed.contains(key)
    }

    fn resolve(&self, code: Option<u16>, scan: Option<u32>) -> Option<String> {
        if let Some(name) = code.and_then(key_name) {
            if let Some(mapped) = self.scancode_map.get(&name) {
                return Some(mapped.clone());
            }
        }

        scan.and_then(|scan| self.scancode_map.get(&scan.to_string()))
            .cloned()
    }
}

/// Kernel name for a key code, e.g. `28` -> `KEY_ENTER`.
pub fn key_name(code: u16) -> Option<String> {
    let name = format!("{:?}", Key::new(code));
    if name.starts_with("KEY_") || name.starts_with("BTN_") {
        Some(name)
    } else {
        None
    }
}
