//! Spacing between retries of a failed store call.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Delays handed out for consecutive store failures within one acquire.
///
/// The n-th delay since the last reset is `base_delay * 2^n` capped at
/// `max_delay`, then moved by up to `jitter_factor` of itself in either
/// direction. All arithmetic is in whole milliseconds, the unit of window
/// scores.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_ms: u64,
    cap_ms: u64,
    jitter_factor: f64,
    failures: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for ExponentialBackoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.jitter_factor)
    }
}

impl ExponentialBackoff {
    /// Jitter outside `0.0..=1.0` is clamped into it.
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            cap_ms: max_delay.as_millis() as u64,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            failures: 0,
        }
    }

    /// Delay to sleep after another failure.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(self.failures))
            .min(self.cap_ms);
        self.failures = self.failures.saturating_add(1);

        let spread = (nominal as f64 * self.jitter_factor) as u64;
        if spread == 0 {
            return Duration::from_millis(nominal);
        }
        let low = nominal.saturating_sub(spread);
        let high = nominal.saturating_add(spread);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    /// Start over after the store answered.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
