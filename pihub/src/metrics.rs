use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::utils::now_epoch_ms;

const DEFAULT_WINDOW_SIZE: usize = 256;
const BACKEND_SEND_P95_TARGET_MS: u64 = 250;

pub type SharedMetrics = Arc<Mutex<RuntimeMetrics>>;

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub samples: usize,
    pub average_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

impl MetricSummary {
    fn empty() -> Self {
        Self {
            samples: 0,
            average_ms: 0,
            p95_ms: 0,
            max_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeliveryCounters {
    pub delivered: u64,
    pub dropped: u64,
}

impl DeliveryCounters {
    fn record(&mut self, delivered: bool) {
        if delivered {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub generated_at_ms: u64,
    pub backend_send: MetricSummary,
    pub backend: DeliveryCounters,
    pub ble: DeliveryCounters,
    pub unmapped_samples: u64,
    pub malformed_samples: u64,
    pub orphan_releases: u64,
    pub dropped_edges: u64,
    pub dropped_actions: u64,
    pub dropped_commands: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
struct RollingMetric {
    values: VecDeque<u64>,
    capacity: usize,
}

impl RollingMetric {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, value_ms: u64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value_ms);
    }

    fn summary(&self) -> MetricSummary {
        if self.values.is_empty() {
            return MetricSummary::empty();
        }

        let samples = self.values.len();
        let sum: u64 = self.values.iter().sum();
        let average_ms = sum / samples as u64;
        let max_ms = *self.values.iter().max().unwrap_or(&0);

        let mut sorted = self.values.iter().copied().collect::<Vec<_>>();
        sorted.sort_unstable();
        let p95_index = ((samples as f64 * 0.95).ceil() as usize)
            .saturating_sub(1)
            .min(samples - 1);
        let p95_ms = sorted[p95_index];

        MetricSummary {
            samples,
            average_ms,
            p95_ms,
            max_ms,
        }
    }
}

/// Drop and delivery counters for the whole pipeline.
#[derive(Debug)]
pub struct RuntimeMetrics {
    backend_send_ms: RollingMetric,
    backend: DeliveryCounters,
    ble: DeliveryCounters,
    unmapped_samples: u64,
    malformed_samples: u64,
    orphan_releases: u64,
    dropped_edges: u64,
    dropped_actions: u64,
    dropped_commands: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self {
            backend_send_ms: RollingMetric::new(DEFAULT_WINDOW_SIZE),
            backend: DeliveryCounters::default(),
            ble: DeliveryCounters::default(),
            unmapped_samples: 0,
            malformed_samples: 0,
            orphan_releases: 0,
            dropped_edges: 0,
            dropped_actions: 0,
            dropped_commands: 0,
        }
    }

    pub fn shared() -> SharedMetrics {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record_backend_send(&mut self, delivered: bool, send_ms: u64) {
        self.backend.record(delivered);
        if delivered {
            self.backend_send_ms.record(send_ms);
        }
    }

    pub fn record_ble(&mut self, delivered: bool) {
        self.ble.record(delivered);
    }

    pub fn record_unmapped(&mut self, count: u64) {
        self.unmapped_samples += count;
    }

    pub fn record_malformed(&mut self, count: u64) {
        self.malformed_samples += count;
    }

    pub fn record_orphan_release(&mut self, count: u64) {
        self.orphan_releases += count;
    }

    pub fn record_edge_drop(&mut self, count: u64) {
        self.dropped_edges += count;
    }

    pub fn record_action_drop(&mut self, count: u64) {
        self.dropped_actions += count;
    }

    pub fn record_command_drop(&mut self, count: u64) {
        self.dropped_commands += count;
    }

    pub fn report(&self) -> MetricsReport {
        let backend_send = self.backend_send_ms.summary();

        let mut warnings = Vec::new();
        if self.dropped_edges > 0 {
            warnings.push(format!(
                "Dropped {} key edges because the pipeline was saturated.",
                self.dropped_edges
            ));
        }
        if self.dropped_actions > 0 {
            warnings.push(format!(
                "Dropped {} resolved actions because the dispatcher was busy.",
                self.dropped_actions
            ));
        }
        if self.dropped_commands > 0 {
            warnings.push(format!(
                "Dropped {} backend commands.",
                self.dropped_commands
            ));
        }
        if backend_send.samples > 0 && backend_send.p95_ms > BACKEND_SEND_P95_TARGET_MS {
            warnings.push(format!(
                "Backend send P95 latency {}ms exceeded target {}ms.",
                backend_send.p95_ms, BACKEND_SEND_P95_TARGET_MS
            ));
        }

        MetricsReport {
            generated_at_ms: now_epoch_ms(),
            backend_send,
            backend: self.backend,
            ble: self.ble,
            unmapped_samples: self.unmapped_samples,
            malformed_samples: self.malformed_samples,
            orphan_releases: self.orphan_releases,
            dropped_edges: self.dropped_edges,
            dropped_actions: self.dropped_actions,
            dropped_commands: self.dropped_commands,
            warnings,
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
