use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use evdev::{Device, InputEventKind, MiscType};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::{Edge, EdgeKind, EdgeNormalizer, InputError, KeyValue, RawSample};
use crate::health::{DeviceState, HealthAggregator};
use crate::metrics::SharedMetrics;
use crate::network::{Backoff, BackoffConfig};
use crate::utils::millis;

const BY_ID_DIR: &str = "/dev/input/by-id";
const KEYBOARD_SUFFIX: &str = "event-kbd";
const PREFERRED_MARKER: &str = "Unifying";
const DROP_WARN_EVERY: u64 = 50;
const REOPEN_BASE: Duration = Duration::from_secs(1);
const REOPEN_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Explicit device node; discovered under `/dev/input/by-id` when unset.
    pub path: Option<PathBuf>,
    pub grab: bool,
}

/// Owns the input device: opens it, feeds samples through the normalizer and
/// reopens it after loss.
pub struct DeviceReader {
    config: ReaderConfig,
    normalizer: EdgeNormalizer,
    edges: mpsc::Sender<Edge>,
    health: Arc<HealthAggregator>,
    metrics: SharedMetrics,
    dropped: u64,
}

impl DeviceReader {
    pub fn new(
        config: ReaderConfig,
        normalizer: EdgeNormalizer,
        edges: mpsc::Sender<Edge>,
        health: Arc<HealthAggregator>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            config,
            normalizer,
            edges,
            health,
            metrics,
            dropped: 0,
        }
    }

    /// Reads until the edge consumer goes away.
    pub async fn run(mut self) -> Result<(), InputError> {
        let mut backoff = Backoff::new(BackoffConfig {
            base: REOPEN_BASE,
            cap: REOPEN_CAP,
        });

        loop {
            match self.read_device(&mut backoff).await {
                Err(InputError::ConsumerClosed) => return Err(InputError::ConsumerClosed),
                Err(err) => warn!("input device unavailable: {err}"),
                Ok(()) => {}
            }
            self.on_device_lost().await?;

            let delay = backoff.next_delay();
            debug!(delay_ms = millis(delay), "reopening input device");
            sleep(delay).await;
        }
    }

    async fn read_device(&mut self, backoff: &mut Backoff) -> Result<(), InputError> {
        let path = match &self.config.path {
            Some(path) => path.clone(),
            None => discover_device(Path::new(BY_ID_DIR))?,
        };

        let mut device = Device::open(&path).map_err(|err| InputError::Open {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        if self.config.grab {
            if let Err(err) = device.grab() {
                warn!(path = %path.display(), "exclusive grab failed: {err}");
            }
        }
        let name = device.name().unwrap_or("unknown").to_string();
        let mut events = device.into_event_stream().map_err(|err| InputError::Open {
            path: path.clone(),
            reason: err.to_string(),
        })?;

        info!(path = %path.display(), name, grab = self.config.grab, "input device opened");
        self.health
            .set_device(DeviceState::Running, Some(path.display().to_string()));
        backoff.reset();

        let mut last_scan = None;
        loop {
            let event = events
                .next_event()
                .await
                .map_err(|err| InputError::Read(err.to_string()))?;

            match event.kind() {
                InputEventKind::Misc(MiscType::MSC_SCAN) => {
                    last_scan = u32::try_from(event.value()).ok();
                }
                InputEventKind::Key(key) => {
                    let Some(value) = KeyValue::from_raw(event.value()) else {
                        debug!(code = key.code(), value = event.value(), "malformed key value");
                        self.metrics.lock().await.record_malformed(1);
                        continue;
                    };
                    let sample = RawSample {
                        code: Some(key.code()),
                        scan: last_scan.take(),
                        value,
                        at: Instant::now(),
                    };
                    self.process(sample).await?;
                }
                InputEventKind::Synchronization(_) => last_scan = None,
                _ => {}
            }
        }
    }

    async fn process(&mut self, sample: RawSample) -> Result<(), InputError> {
        let unmapped_before = self.normalizer.unmapped();
        let orphaned_before = self.normalizer.orphaned();
        let edge = self.normalizer.push(sample);
        let unmapped = self.normalizer.unmapped() - unmapped_before;
        let orphaned = self.normalizer.orphaned() - orphaned_before;
        if unmapped > 0 || orphaned > 0 {
            let mut metrics = self.metrics.lock().await;
            metrics.record_unmapped(unmapped);
            metrics.record_orphan_release(orphaned);
        }

        match edge {
            Some(edge) => self.forward(edge).await,
            None => Ok(()),
        }
    }

    /// Downs are dropped when the queue is full and their press is forgotten.
    /// Ups always follow a forwarded down and wait for room instead.
    async fn forward(&mut self, edge: Edge) -> Result<(), InputError> {
        if edge.kind == EdgeKind::Up {
            return self
                .edges
                .send(edge)
                .await
                .map_err(|_| InputError::ConsumerClosed);
        }

        match self.edges.try_send(edge) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(edge)) => {
                self.normalizer.cancel_press(&edge.key);
                self.dropped += 1;
                self.metrics.lock().await.record_edge_drop(1);
                if self.dropped % DROP_WARN_EVERY == 1 {
                    warn!(
                        key = edge.key.as_str(),
                        kind = edge.kind.as_str(),
                        dropped = self.dropped,
                        "edge queue full; dropping"
                    );
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(InputError::ConsumerClosed),
        }
    }

    async fn on_device_lost(&mut self) -> Result<(), InputError> {
        self.health.set_device(DeviceState::Stopped, None);
        for edge in self.normalizer.release_all(Instant::now()) {
            debug!(key = edge.key.as_str(), "releasing held key after device loss");
            self.forward(edge).await?;
        }
        Ok(())
    }
}

/// Picks a keyboard-like node in `dir`, preferring a Logitech Unifying receiver.
pub fn discover_device(dir: &Path) -> Result<PathBuf, InputError> {
    let entries = std::fs::read_dir(dir).map_err(|_| InputError::NoDevice)?;
    let mut candidates: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.ends_with(KEYBOARD_SUFFIX).then(|| (name, entry.path()))
        })
        .collect();
    candidates.sort();

    candidates
        .iter()
        .find(|(name, _)| name.contains(PREFERRED_MARKER))
        .or_else(|| candidates.first())
        .map(|(_, path)| path.clone())
        .ok_or(InputError::NoDevice)
}
