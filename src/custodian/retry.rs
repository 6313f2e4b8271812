//! Retry Policy
//!
//! Exponential backoff with randomized jitter for transient custodian
//! errors. Wraps individual calls inside the circuit breaker; business
//! rejections are never retried.

use std::time::Duration;

use rand::Rng;

use crate::config::ResilienceConfig;

/// Backoff parameters, usually derived from [`ResilienceConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per call (first try included)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Backoff multiplier per retry
    pub multiplier: f64,
    /// Backoff cap
    pub max_delay: Duration,
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

impl RetryPolicy {
    /// Deterministic backoff for the retry following attempt `attempt`
    /// (0-based): `base * multiplier^attempt`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Backoff with uniform jitter in `[backoff/2, backoff]`, so a burst
    /// of callers does not retry in lockstep
    pub fn jittered(&self, attempt: u32) -> Duration {
        let full = self.backoff(attempt);
        if full.is_zero() {
            return full;
        }
        let millis = full.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}
