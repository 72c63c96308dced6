//! Retry policy and backoff math (spec.md §3 `retryPolicy`, §4.F step 8).

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    Fixed,
    LinearBackoff,
    ExpBackoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub strategy: RetryStrategy,
    /// Status codes to retry even if the classifier's default says no.
    /// `non_retryable_codes` takes precedence when a code is in both sets
    /// (spec.md §3 `retryPolicy.retryableCodes`).
    pub retryable_codes: HashSet<u16>,
    /// Status codes to never retry even if the classifier's default says
    /// yes (spec.md §3 `retryPolicy.nonRetryableCodes`).
    pub non_retryable_codes: HashSet<u16>,
    /// Clamp for `expBackoff` (spec.md §4.F step 8, default 30s).
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            strategy: RetryStrategy::ExpBackoff,
            retryable_codes: [408, 429, 502, 503, 504].into_iter().collect(),
            non_retryable_codes: HashSet::new(),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Default configured delay for a `429` with no server-suggested
/// `Retry-After` (spec.md §4.F step 8).
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);

impl RetryPolicy {
    /// `delay(attemptCount, strategy, baseDelay)` from spec.md §4.F step 8.
    /// `attempt` is 1-based (the attempt that just failed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            RetryStrategy::Fixed => base_ms,
            RetryStrategy::LinearBackoff => base_ms * attempt as f64,
            RetryStrategy::ExpBackoff => base_ms * 2f64.powi(attempt as i32 - 1),
        };
        let clamped_ms = raw_ms.min(self.max_backoff.as_millis() as f64);
        let jitter_ms = fastrand::f64() * 100.0;
        Duration::from_millis((clamped_ms + jitter_ms) as u64)
    }

    /// `429` override: prefer a server-suggested `Retry-After` value, else
    /// fall back to a longer configured default (spec.md §4.F step 8).
    pub fn rate_limited_delay(&self, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or(DEFAULT_RATE_LIMIT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_backoff_grows_and_clamps() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::ExpBackoff,
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(35),
            ..RetryPolicy::default()
        };
        // attempt 1 => 10ms + jitter, attempt 2 => 20ms + jitter, attempt 3 => clamp(40ms) = 35ms + jitter
        let d1 = policy.delay(1);
        let d2 = policy.delay(2);
        let d3 = policy.delay(3);
        assert!(d1.as_millis() >= 10 && d1.as_millis() < 110);
        assert!(d2.as_millis() >= 20 && d2.as_millis() < 120);
        assert!(d3.as_millis() >= 35 && d3.as_millis() < 135);
    }

    #[test]
    fn fixed_strategy_does_not_grow() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            base_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        assert!(policy.delay(1).as_millis() >= 50);
        assert!(policy.delay(5).as_millis() < 150);
    }
}
