pub mod macros;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::dispatch::{Delivery, DropReason};
use crate::health::HealthAggregator;
use crate::input::EdgeKind;
pub use macros::{MacroOutcome, MacroStep};

#[derive(Debug, Error)]
pub enum HidError {
    #[error("no HID transport is linked")]
    NoTransport,
    #[error("HID report rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HidUsage {
    Keyboard,
    Consumer,
}

impl HidUsage {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "keyboard" => Some(Self::Keyboard),
            "consumer" => Some(Self::Consumer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HidLinkState {
    Unavailable,
    Advertising,
    Connected,
    Ready,
}

/// One press or release of a resolved usage id, handed to the BLE stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidReport {
    pub usage: HidUsage,
    pub usage_id: u16,
    pub pressed: bool,
}

/// Seam to the BLE GATT stack, which owns advertising and report encoding.
pub trait HidTransport: Send + Sync {
    fn send_report(&self, report: HidReport) -> Result<(), HidError>;
}

/// Used when no BLE stack is linked into the process.
pub struct NullTransport;

impl HidTransport for NullTransport {
    fn send_report(&self, _report: HidReport) -> Result<(), HidError> {
        Err(HidError::NoTransport)
    }
}

const KEYBOARD_USAGES: &[(&str, u16)] = &[
    ("enter", 0x28),
    ("esc", 0x29),
    ("escape", 0x29),
    ("backspace", 0x2A),
    ("tab", 0x2B),
    ("space", 0x2C),
    ("minus", 0x2D),
    ("equal", 0x2E),
    ("f1", 0x3A),
    ("f2", 0x3B),
    ("f3", 0x3C),
    ("f4", 0x3D),
    ("f5", 0x3E),
    ("f6", 0x3F),
    ("f7", 0x40),
    ("f8", 0x41),
    ("f9", 0x42),
    ("f10", 0x43),
    ("f11", 0x44),
    ("f12", 0x45),
    ("insert", 0x49),
    ("home", 0x4A),
    ("page_up", 0x4B),
    ("delete", 0x4C),
    ("end", 0x4D),
    ("page_down", 0x4E),
    ("right", 0x4F),
    ("left", 0x50),
    ("down", 0x51),
    ("up", 0x52),
    ("menu", 0x65),
];

const CONSUMER_USAGES: &[(&str, u16)] = &[
    ("power", 0x30),
    ("sleep", 0x32),
    ("menu", 0x40),
    ("menu_pick", 0x41),
    ("menu_up", 0x42),
    ("menu_down", 0x43),
    ("menu_left", 0x44),
    ("menu_right", 0x45),
    ("menu_escape", 0x46),
    ("channel_up", 0x9C),
    ("channel_down", 0x9D),
    ("play", 0xB0),
    ("pause", 0xB1),
    ("record", 0xB2),
    ("fast_forward", 0xB3),
    ("rewind", 0xB4),
    ("next_track", 0xB5),
    ("prev_track", 0xB6),
    ("stop", 0xB7),
    ("play_pause", 0xCD),
    ("mute", 0xE2),
    ("volume_up", 0xE9),
    ("volume_down", 0xEA),
    ("ac_search", 0x221),
    ("ac_home", 0x223),
    ("ac_back", 0x224),
];

/// Resolves a symbolic code such as `volume_up` or `a` to its HID usage id.
pub fn usage_id(usage: HidUsage, code: &str) -> Option<u16> {
    let code = code.trim().to_ascii_lowercase();
    let table = match usage {
        HidUsage::Keyboard => {
            if let Some(id) = keyboard_alnum(&code) {
                return Some(id);
            }
            KEYBOARD_USAGES
        }
        HidUsage::Consumer => CONSUMER_USAGES,
    };
    table
        .iter()
        .find(|(name, _)| *name == code)
        .map(|(_, id)| *id)
}

fn keyboard_alnum(code: &str) -> Option<u16> {
    let mut chars = code.chars();
    let ch = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    match ch {
        'a'..='z' => Some(0x04 + (ch as u16 - 'a' as u16)),
        '1'..='9' => Some(0x1E + (ch as u16 - '1' as u16)),
        '0' => Some(0x27),
        _ => None,
    }
}

/// Wireless HID output. Sends are accepted only while the link is ready and
/// are never retried or repeated.
pub struct HidChannel {
    transport: Arc<dyn HidTransport>,
    link: watch::Sender<HidLinkState>,
    failures: AtomicU32,
    health: Arc<HealthAggregator>,
}

impl HidChannel {
    pub fn new(transport: Arc<dyn HidTransport>, health: Arc<HealthAggregator>) -> Self {
        let (link, _) = watch::channel(HidLinkState::Unavailable);
        Self {
            transport,
            link,
            failures: AtomicU32::new(0),
            health,
        }
    }

    pub fn link_state(&self) -> HidLinkState {
        *self.link.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.link_state() == HidLinkState::Ready
    }

    pub fn subscribe(&self) -> watch::Receiver<HidLinkState> {
        self.link.subscribe()
    }

    /// Called by the BLE stack on every advertising or connection transition.
    pub fn set_link_state(&self, state: HidLinkState) {
        let previous = self.link.send_replace(state);
        if previous == state {
            return;
        }

        info!(from = ?previous, to = ?state, "hid link state changed");
        let ready = state == HidLinkState::Ready;
        self.health.update_ble(|ble| {
            if ready {
                ble.mark_connected();
            } else {
                ble.mark_disconnected();
            }
        });
        if ready {
            self.failures.store(0, Ordering::Relaxed);
        }
    }

    pub fn send(&self, usage: HidUsage, code: &str, edge: EdgeKind) -> Delivery {
        if !self.is_ready() {
            return Delivery::dropped(DropReason::NotConnected);
        }

        let Some(usage_id) = usage_id(usage, code) else {
            return Delivery::dropped(DropReason::UnknownUsage {
                usage,
                code: code.to_string(),
            });
        };

        let report = HidReport {
            usage,
            usage_id,
            pressed: edge == EdgeKind::Down,
        };
        match self.transport.send_report(report) {
            Ok(()) => {
                debug!(?usage, code, edge = edge.as_str(), "hid report sent");
                if self.failures.swap(0, Ordering::Relaxed) > 0 {
                    self.health.update_ble(|ble| ble.record_success());
                }
                Delivery::delivered()
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let reason = err.to_string();
                warn!(?usage, code, "hid report failed: {reason}");
                self.health.update_ble(|ble| ble.record_failure(reason.clone()));
                Delivery::dropped(DropReason::Transport(reason))
            }
        }
    }

    /// Plays a fixed step list as press, hold, release, gap.
    ///
    /// Nothing is sent when the link is not ready at the start; if it drops
    /// midway, the remaining steps are abandoned. A step counts as sent only
    /// once its release was delivered.
    pub async fn run_sequence(
        &self,
        steps: &[MacroStep],
        tap: Duration,
        inter_delay: Duration,
    ) -> MacroOutcome {
        let mut outcome = MacroOutcome {
            total: steps.len(),
            sent: 0,
        };
        if !self.is_ready() {
            return outcome;
        }

        for (index, step) in steps.iter().enumerate() {
            if index > 0 {
                sleep(inter_delay).await;
            }

            let press = self.send(step.usage, step.code, EdgeKind::Down);
            if !press.delivered {
                warn!(
                    step = index,
                    total = steps.len(),
                    reason = ?press.reason,
                    "macro aborted"
                );
                break;
            }

            sleep(step.hold.unwrap_or(tap)).await;

            let release = self.send(step.usage, step.code, EdgeKind::Up);
            if !release.delivered {
                warn!(
                    step = index,
                    total = steps.len(),
                    reason = ?release.reason,
                    "macro aborted during release"
                );
                break;
            }
            outcome.sent += 1;
        }

        outcome
    }

    pub fn close(&self) {
        self.set_link_state(HidLinkState::Unavailable);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::channel;
    use super::*;

    #[test]
    fn usage_tables_resolve_symbolic_codes() {
        assert_eq!(usage_id(HidUsage::Keyboard, "a"), Some(0x04));
        assert_eq!(usage_id(HidUsage::Keyboard, "Z"), Some(0x1D));
        assert_eq!(usage_id(HidUsage::Keyboard, "0"), Some(0x27));
        assert_eq!(usage_id(HidUsage::Keyboard, "enter"), Some(0x28));
        assert_eq!(usage_id(HidUsage::Consumer, "volume_up"), Some(0xE9));
        assert_eq!(usage_id(HidUsage::Consumer, "ac_home"), Some(0x223));
        assert_eq!(usage_id(HidUsage::Consumer, "a"), None);
        assert_eq!(usage_id(HidUsage::Keyboard, "warp"), None);
    }

    #[test]
    fn send_is_refused_until_ready() {
        let (channel, transport, _) = channel();
        for state in [
            HidLinkState::Unavailable,
            HidLinkState::Advertising,
            HidLinkState::Connected,
        ] {
            channel.set_link_state(state);
            let delivery = channel.send(HidUsage::Consumer, "play_pause", EdgeKind::Down);
            assert_eq!(delivery, Delivery::dropped(DropReason::NotConnected));
        }
        assert!(transport.reports().is_empty());

        channel.set_link_state(HidLinkState::Ready);
        assert!(
            channel
                .send(HidUsage::Consumer, "play_pause", EdgeKind::Down)
                .delivered
        );
        assert_eq!(
            transport.reports(),
            vec![HidReport {
                usage: HidUsage::Consumer,
                usage_id: 0xCD,
                pressed: true,
            }]
        );
    }

    #[test]
    fn link_state_feeds_health() {
        let (channel, _, health) = channel();
        channel.set_link_state(HidLinkState::Ready);
        assert!(health.snapshot().ble_available);

        channel.close();
        assert!(!health.snapshot().ble_available);
    }

    #[test]
    fn transport_errors_are_reported_not_retried() {
        let (channel, transport, health) = channel();
        channel.set_link_state(HidLinkState::Ready);
        transport.reject.store(true, Ordering::Relaxed);

        let delivery = channel.send(HidUsage::Keyboard, "up", EdgeKind::Down);
        assert!(!delivery.delivered);
        assert!(matches!(delivery.reason, Some(DropReason::Transport(_))));
        assert_eq!(health.snapshot().ble.consecutive_failures, 1);

        transport.reject.store(false, Ordering::Relaxed);
        assert!(channel.send(HidUsage::Keyboard, "up", EdgeKind::Up).delivered);
        assert_eq!(transport.reports().len(), 1);
        assert_eq!(health.snapshot().ble.consecutive_failures, 0);
    }

    #[test]
    fn unknown_codes_are_dropped() {
        let (channel, _, _) = channel();
        channel.set_link_state(HidLinkState::Ready);
        let delivery = channel.send(HidUsage::Consumer, "warp_drive", EdgeKind::Down);
        assert!(matches!(
            delivery.reason,
            Some(DropReason::UnknownUsage { .. })
        ));
    }

    async fn run_with_link_drop(drop_at: Duration) -> (MacroOutcome, Vec<HidReport>) {
        let (channel, transport, _) = channel();
        channel.set_link_state(HidLinkState::Ready);
        let steps = [
            MacroStep::tap(HidUsage::Consumer, "menu"),
            MacroStep::tap(HidUsage::Consumer, "menu"),
            MacroStep::tap(HidUsage::Consumer, "menu"),
        ];

        let dropper = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                sleep(drop_at).await;
                channel.set_link_state(HidLinkState::Advertising);
            })
        };

        let outcome = channel
            .run_sequence(&steps, Duration::from_millis(40), Duration::from_millis(100))
            .await;
        dropper.await.expect("dropper task");
        (outcome, transport.reports())
    }

    // Steps press at 0, 140 and 280 ms and release 40 ms later.

    #[tokio::test(start_paused = true)]
    async fn sequence_stops_when_link_drops_between_steps() {
        let (outcome, reports) = run_with_link_drop(Duration::from_millis(200)).await;

        assert_eq!(outcome.sent, 2);
        assert!(!outcome.completed());
        assert_eq!(reports.len(), 4);
        assert!(!reports[3].pressed);
    }

    #[tokio::test(start_paused = true)]
    async fn step_with_failed_release_is_not_counted() {
        let (outcome, reports) = run_with_link_drop(Duration::from_millis(150)).await;

        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.total, 3);
        assert_eq!(reports.len(), 3);
        assert!(reports[2].pressed);
    }
}
