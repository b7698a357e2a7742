//! Retry policy for provider fetches
//!
//! Kept separate from the scheduler so the backoff arithmetic and the
//! retryable-error predicate can be tested without any I/O.

use super::FetchError;
use crate::config::RetrySettings;
use std::time::Duration;

/// Linear-backoff retry policy
///
/// `max_attempts` counts every attempt including the first. The delay
/// before attempt `n` (1-based, n ≥ 2) is `base_delay × (n - 1)`, i.e. the
/// first retry waits one base delay, the second two, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn disabled() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        if settings.enabled {
            Self::new(settings.max_attempts, Duration::from_millis(settings.delay_ms))
        } else {
            Self::disabled()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Whether to make another attempt after `attempt` failed with `error`
    pub fn should_retry(&self, attempt: u32, error: &FetchError) -> bool {
        attempt < self.max_attempts && error.is_transient()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
