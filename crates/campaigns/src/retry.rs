use feedback_core::config::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration with exponential backoff for failed sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per queue entry, the first send included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    /// Ceiling for any single backoff.
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
