//! Hold tracking on top of the edge stream: long-press and synthetic repeat.
//!
//! Down and up edges are always forwarded as they arrive. Long-press and
//! repeat events are layered on top and are computed from the press start of
//! each key, so a late scheduler tick catches up instead of drifting.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::input::{Edge, EdgeKind};

pub const DEFAULT_REPEAT_INITIAL_MS: u64 = 400;
pub const DEFAULT_REPEAT_RATE_MS: u64 = 400;
pub const DEFAULT_LONG_PRESS_MS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatConfig {
    pub initial_delay: Duration,
    pub rate: Duration,
}

impl RepeatConfig {
    pub fn new(initial_delay: Duration, rate: Duration) -> Self {
        Self {
            initial_delay,
            rate: rate.max(Duration::from_millis(1)),
        }
    }
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_REPEAT_INITIAL_MS),
            Duration::from_millis(DEFAULT_REPEAT_RATE_MS),
        )
    }
}

/// Per-key hold parameters, captured when the key goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTiming {
    pub long_press: Duration,
    pub repeat: bool,
}

impl Default for KeyTiming {
    fn default() -> Self {
        Self {
            long_press: Duration::from_millis(DEFAULT_LONG_PRESS_MS),
            repeat: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Down,
    Up,
    LongPress,
    Repeat,
}

impl From<EdgeKind> for EventKind {
    fn from(kind: EdgeKind) -> Self {
        match kind {
            EdgeKind::Down => Self::Down,
            EdgeKind::Up => Self::Up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub kind: EventKind,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct KeyState {
    down: bool,
    pressed_at: Option<Instant>,
    long_press_fired: bool,
    repeat_ticks: u32,
    timing: KeyTiming,
}

impl KeyState {
    fn press(&mut self, at: Instant, timing: KeyTiming) {
        self.down = true;
        self.pressed_at = Some(at);
        self.long_press_fired = false;
        self.repeat_ticks = 0;
        self.timing = timing;
    }

    fn clear(&mut self) {
        self.down = false;
        self.pressed_at = None;
        self.long_press_fired = false;
        self.repeat_ticks = 0;
    }

    fn advance(&mut self, key: &str, now: Instant, repeat: RepeatConfig, out: &mut Vec<KeyEvent>) {
        let Some(pressed_at) = self.pressed_at.filter(|_| self.down) else {
            return;
        };
        let elapsed = now.saturating_duration_since(pressed_at);

        if !self.long_press_fired && elapsed >= self.timing.long_press {
            self.long_press_fired = true;
            out.push(KeyEvent {
                key: key.to_string(),
                kind: EventKind::LongPress,
                at: pressed_at + self.timing.long_press,
            });
        }

        if self.timing.repeat && elapsed >= repeat.initial_delay {
            let since_first = elapsed - repeat.initial_delay;
            let due = (since_first.as_nanos() / repeat.rate.as_nanos()) as u32 + 1;
            while self.repeat_ticks < due {
                out.push(KeyEvent {
                    key: key.to_string(),
                    kind: EventKind::Repeat,
                    at: pressed_at + repeat.initial_delay + repeat.rate * self.repeat_ticks,
                });
                self.repeat_ticks += 1;
            }
        }
    }
}

pub struct TimingEngine {
    repeat: RepeatConfig,
    keys: HashMap<String, KeyState>,
}

impl TimingEngine {
    pub fn new(repeat: RepeatConfig) -> Self {
        Self {
            repeat,
            keys: HashMap::new(),
        }
    }

    pub fn on_edge(&mut self, edge: Edge, timing: KeyTiming) -> Vec<KeyEvent> {
        let mut out = Vec::new();
        let state = self.keys.entry(edge.key.clone()).or_default();

        match edge.kind {
            EdgeKind::Down => {
                state.press(edge.at, timing);
            }
            EdgeKind::Up => {
                // Anything that came due before the release still belongs to this hold.
                state.advance(&edge.key, edge.at, self.repeat, &mut out);
                out.sort_by_key(|event| event.at);
                state.clear();
            }
        }

        out.push(KeyEvent {
            key: edge.key,
            kind: edge.kind.into(),
            at: edge.at,
        });
        out
    }

    pub fn tick(&mut self, now: Instant) -> Vec<KeyEvent> {
        let mut out = Vec::new();
        for (key, state) in self.keys.iter_mut().filter(|(_, state)| state.down) {
            state.advance(key, now, self.repeat, &mut out);
        }
        out.sort_by_key(|event| event.at);
        out
    }

    pub fn has_held_keys(&self) -> bool {
        self.keys.values().any(|state| state.down)
    }

    /// Forgets every hold without firing anything.
    pub fn cancel_all(&mut self) {
        for state in self.keys.values_mut() {
            state.clear();
        }
    }
}
