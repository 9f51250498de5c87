use std::time::Duration;

use rand::Rng;

use super::BackoffConfig;

const JITTER_MIN: f64 = 0.01;
const JITTER_MAX: f64 = 0.25;

/// Exponential reconnect delay with a cap and non-zero random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Un-jittered delay for the `attempt`-th retry: `base * 2^attempt`, capped.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.config
            .base
            .checked_mul(factor)
            .unwrap_or(self.config.cap)
            .min(self.config.cap)
    }

    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let mut rng = rand::thread_rng();
        let magnitude = rng.gen_range(JITTER_MIN..=JITTER_MAX);
        let factor = if rng.gen_bool(0.5) {
            1.0 + magnitude
        } else {
            1.0 - magnitude
        };
        nominal.mul_f64(factor)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
