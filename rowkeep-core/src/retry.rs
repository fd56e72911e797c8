//! Retry policy for rate-limited remote calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_RETRY_CAP_MS: u64 = 5_000;

/// How many times to try a rate-limited call and how long to wait between
/// tries.
///
/// Backoff grows linearly and is capped: `min(base + retry_index * base, cap)`.
/// Quota windows recover on a fixed cadence, so doubling waits only adds
/// latency without improving the odds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            cap: Duration::from_millis(DEFAULT_RETRY_CAP_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    /// A policy that never sleeps; for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Wait before retry number `retry_index` (0 for the first retry).
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let linear = self
            .base
            .saturating_add(self.base.saturating_mul(retry_index));
        linear.min(self.cap)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Upper bound on time spent sleeping across all retries.
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|i| self.backoff(i))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}
