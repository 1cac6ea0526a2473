//! Reload backoff

use roomcast_core::PlaybackConfig;
use std::time::Duration;

use crate::error::{PlaybackError, PlaybackResult};

/// Exponential reload backoff with a cap and a retry budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1_000),
            factor: 1.5,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PlaybackConfig) -> PlaybackResult<Self> {
        if !config.backoff_factor.is_finite() || config.backoff_factor < 1.0 {
            return Err(PlaybackError::Config("backoff_factor must be a finite number >= 1".to_string()));
        }
        if config.base_delay_ms > config.max_delay_ms {
            return Err(PlaybackError::Config("base_delay_ms must not exceed max_delay_ms".to_string()));
        }
        Ok(Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
        })
    }

    /// Whether another reload may be scheduled after `retry_count` reloads
    #[must_use]
    pub const fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// `min(base * factor^retry_count, cap)`
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap).round() as u64)
    }
}
