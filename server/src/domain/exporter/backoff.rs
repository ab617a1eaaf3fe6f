//! Capped exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

use crate::core::config::RetryConfig;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    initial_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: f64,
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_ms: config.initial_ms as f64,
            max_ms: config.max_ms as f64,
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl BackoffPolicy {
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms as u64)
    }

    /// Delay before the attempt following the `attempt`-th failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().r#gen();
        self.delay_with_sample(attempt, sample)
    }

    /// `min(initial * multiplier^(attempt-1) * (1 + jitter * sample), max)`
    /// for a sample in [0, 1)
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_ms * self.multiplier.powi(exponent);
        let jittered = base * (1.0 + self.jitter * sample.clamp(0.0, 1.0));
        Duration::from_millis(jittered.min(self.max_ms) as u64)
    }
}
