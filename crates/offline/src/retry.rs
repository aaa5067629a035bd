//! Retry policies for the two retry tiers.
//!
//! - **Worker tier** (`RetryPolicy`): a few fast attempts with exponential backoff
//!   while an item is `pending`.
//! - **Auto-retry tier** (`AutoRetryConfig`, see `config`): slow, capped re-attempts
//!   of `permanently_failed` items.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker-tier retry policy.
///
/// The n-th consecutive failure (1-indexed) delays the next attempt by
/// `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failures after which an item becomes permanently failed.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Policy that retries immediately (tests, manual drains).
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    /// Calculate the delay after the given failure number (1-indexed).
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        // 2^31 already dwarfs any sane cap; clamp the exponent to avoid overflow.
        let exp = (failures - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether an item that has failed `failures` times may go back to `pending`.
    pub fn should_retry(&self, failures: u32, max_retries: u32) -> bool {
        failures < max_retries
    }
}
