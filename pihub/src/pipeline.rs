//! Edge stream → timing → keymap → dispatcher queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::dispatch::Action;
use crate::input::Edge;
use crate::keymap::KeymapResolver;
use crate::metrics::SharedMetrics;
use crate::timing::{KeyEvent, TimingEngine};

pub const SCHEDULER_TICK: Duration = Duration::from_millis(10);
const DROP_WARN_EVERY: u64 = 50;

pub struct Pipeline {
    timing: TimingEngine,
    resolver: Arc<KeymapResolver>,
    actions: mpsc::Sender<Action>,
    metrics: SharedMetrics,
    dropped: u64,
}

impl Pipeline {
    pub fn new(
        timing: TimingEngine,
        resolver: Arc<KeymapResolver>,
        actions: mpsc::Sender<Action>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            timing,
            resolver,
            actions,
            metrics,
            dropped: 0,
        }
    }

    /// Runs until the edge source closes. Held keys are dropped without firing
    /// when the task is aborted.
    pub async fn run(mut self, mut edges: mpsc::Receiver<Edge>) {
        let mut ticker = interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                edge = edges.recv() => match edge {
                    Some(edge) => self.on_edge(edge).await,
                    None => break,
                },
                now = ticker.tick(), if self.timing.has_held_keys() => {
                    self.on_tick(now).await;
                }
            }
        }

        self.timing.cancel_all();
        debug!("pipeline stopped");
    }

    async fn on_edge(&mut self, edge: Edge) {
        let timing = self.resolver.timing_for(&edge.key);
        let events = self.timing.on_edge(edge, timing);
        self.resolve_all(events).await;
    }

    async fn on_tick(&mut self, now: Instant) {
        let events = self.timing.tick(now);
        self.resolve_all(events).await;
    }

    async fn resolve_all(&mut self, events: Vec<KeyEvent>) {
        for event in events {
            let Some(action) = self.resolver.resolve(&event) else {
                continue;
            };
            debug!(key = event.key.as_str(), kind = ?event.kind, channel = ?action.channel(), "resolved");

            if let Err(err) = self.actions.try_send(action) {
                self.dropped += 1;
                self.metrics.lock().await.record_action_drop(1);
                if self.dropped % DROP_WARN_EVERY == 1 {
                    let reason = match err {
                        TrySendError::Full(_) => "full",
                        TrySendError::Closed(_) => "closed",
                    };
                    warn!(
                        key = event.key.as_str(),
                        dropped = self.dropped,
                        reason,
                        "action queue unavailable; dropping"
                    );
                }
            }
        }
    }
}
