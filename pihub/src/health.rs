use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::utils::now_epoch_ms;

/// Liveness of one output channel. Written only by the channel that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl ChannelStatus {
    pub fn mark_connected(&mut self) {
        self.connected = true;
        self.consecutive_failures = 0;
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: OverallStatus,
    pub ws_connected: bool,
    pub last_activity: Option<String>,
    pub ble_available: bool,
    pub usb_reader: DeviceState,
    pub usb_device: Option<String>,
    pub backend: ChannelStatus,
    pub ble: ChannelStatus,
    pub updated_at_ms: u64,
}

impl HealthSnapshot {
    fn initial() -> Self {
        Self {
            status: OverallStatus::Degraded,
            ws_connected: false,
            last_activity: None,
            ble_available: false,
            usb_reader: DeviceState::Stopped,
            usb_device: None,
            backend: ChannelStatus::default(),
            ble: ChannelStatus::default(),
            updated_at_ms: now_epoch_ms(),
        }
    }

    fn recompute(&mut self) {
        self.ws_connected = self.backend.connected;
        self.ble_available = self.ble.connected;
        // BLE is informational only.
        self.status = if self.ws_connected && self.usb_reader == DeviceState::Running {
            OverallStatus::Ok
        } else {
            OverallStatus::Degraded
        };
        self.updated_at_ms = now_epoch_ms();
    }
}

/// Process-wide health state, recomputed on every transition so reads stay cheap.
pub struct HealthAggregator {
    state: watch::Sender<HealthSnapshot>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(HealthSnapshot::initial());
        Self { state }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.state.subscribe()
    }

    pub fn update_backend(&self, change: impl FnOnce(&mut ChannelStatus)) {
        self.update(|snapshot| change(&mut snapshot.backend));
    }

    pub fn update_ble(&self, change: impl FnOnce(&mut ChannelStatus)) {
        self.update(|snapshot| change(&mut snapshot.ble));
    }

    pub fn set_device(&self, state: DeviceState, device: Option<String>) {
        self.update(|snapshot| {
            snapshot.usb_reader = state;
            if device.is_some() {
                snapshot.usb_device = device;
            }
        });
    }

    pub fn set_activity(&self, activity: Option<String>) {
        self.update(|snapshot| snapshot.last_activity = activity);
    }

    fn update(&self, change: impl FnOnce(&mut HealthSnapshot)) {
        let mut flipped = None;
        self.state.send_modify(|snapshot| {
            let before = snapshot.status;
            change(snapshot);
            snapshot.recompute();
            if snapshot.status != before {
                flipped = Some(snapshot.clone());
            }
        });

        if let Some(snapshot) = flipped {
            match snapshot.status {
                OverallStatus::Ok => info!(
                    ws_connected = snapshot.ws_connected,
                    ble_available = snapshot.ble_available,
                    "health ok"
                ),
                OverallStatus::Degraded => warn!(
                    ws_connected = snapshot.ws_connected,
                    usb_reader = ?snapshot.usb_reader,
                    backend_error = ?snapshot.backend.last_error,
                    "health degraded"
                ),
            }
        }
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_degraded_until_reader_and_backend_are_up() {
        let health = HealthAggregator::new();
        assert_eq!(health.snapshot().status, OverallStatus::Degraded);

        health.set_device(DeviceState::Running, Some("/dev/input/event3".to_string()));
        assert_eq!(health.snapshot().status, OverallStatus::Degraded);

        health.update_backend(ChannelStatus::mark_connected);
        let snapshot = health.snapshot();
        assert_eq!(snapshot.status, OverallStatus::Ok);
        assert!(snapshot.ws_connected);
        assert_eq!(snapshot.usb_device.as_deref(), Some("/dev/input/event3"));
    }

    #[test]
    fn ble_loss_is_informational() {
        let health = HealthAggregator::new();
        health.set_device(DeviceState::Running, None);
        health.update_backend(ChannelStatus::mark_connected);
        health.update_ble(ChannelStatus::mark_connected);
        assert!(health.snapshot().ble_available);

        health.update_ble(|ble| {
            ble.mark_disconnected();
            ble.record_failure("link lost");
        });

        let snapshot = health.snapshot();
        assert!(!snapshot.ble_available);
        assert_eq!(snapshot.status, OverallStatus::Ok);
        assert_eq!(snapshot.ble.last_error.as_deref(), Some("link lost"));
    }

    #[test]
    fn device_loss_degrades() {
        let health = HealthAggregator::new();
        health.set_device(DeviceState::Running, None);
        health.update_backend(ChannelStatus::mark_connected);
        health.set_device(DeviceState::Stopped, None);
        assert_eq!(health.snapshot().status, OverallStatus::Degraded);
    }

    #[test]
    fn failures_accumulate_until_reconnect() {
        let health = HealthAggregator::new();
        health.update_backend(|backend| backend.record_failure("refused"));
        health.update_backend(|backend| backend.record_failure("timeout"));

        let backend = health.snapshot().backend;
        assert_eq!(backend.consecutive_failures, 2);
        assert_eq!(backend.last_error.as_deref(), Some("timeout"));

        health.update_backend(ChannelStatus::mark_connected);
        assert_eq!(health.snapshot().backend.consecutive_failures, 0);
    }

    #[test]
    fn snapshot_serializes_for_status_surface() {
        let health = HealthAggregator::new();
        health.set_activity(Some("watch".to_string()));
        let json = serde_json::to_value(health.snapshot()).expect("snapshot should serialize");

        assert_eq!(json["status"], "degraded");
        assert_eq!(json["last_activity"], "watch");
        assert_eq!(json["usb_reader"], "stopped");
    }
}
