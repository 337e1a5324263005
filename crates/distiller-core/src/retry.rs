use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::RetryConfig;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_JITTER: Duration = Duration::from_millis(1_000);

/// Backoff schedule for one turn. Attempts are 1-based; the failure of
/// attempt `n` schedules attempt `n + 1` after `compute_delay(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_max: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        should_retry(attempt, self.max_attempts)
    }

    /// Deterministic part of the delay: base doubled per attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: config
                .max_attempts
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            base_delay: config
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: config
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            jitter_max: config
                .jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.jitter_max),
        }
    }
}

pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt < max_attempts
}

/// Whole seconds shown in the countdown, rounded up.
pub fn display_seconds(delay: Duration) -> u64 {
    let millis = delay.as_millis() as u64;
    millis.div_ceil(1_000)
}

/// Sleeps for `delay`. Returns false if `cancel` fired first.
pub async fn wait_for_retry(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
