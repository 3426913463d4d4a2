//! Bounded exponential backoff for retryable provider failures.
//!
//! A failed request is retried only when [`ProviderError::is_retryable`]
//! says so, at most `max_retries` times, sleeping `base * 2^attempt`
//! (capped at `max_delay`, and never shorter than a rate limit's
//! `retry_after`) between attempts. The caller owns the loop so it can
//! stop early once output has reached the user or the turn is cancelled.

use std::time::Duration;

use termagent_config::RetryConfig;
use termagent_core::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Whether a failure on retry number `attempt` (0-based) may be retried.
    pub fn allows(&self, attempt: u32, error: &ProviderError) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        match error {
            ProviderError::RateLimited { retry_after_secs } => {
                backoff.max(Duration::from_secs(*retry_after_secs).min(self.max_delay))
            }
            _ => backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
