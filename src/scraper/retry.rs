use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ScrapeError;

/// Retry settings for render and navigation calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the initial failure
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub ceiling_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 4_000,
            multiplier: 2.0,
            ceiling_ms: 60_000,
        }
    }
}

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Exponential backoff policy. Holds no state between calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    multiplier: f64,
    ceiling: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            ceiling: Duration::from_millis(config.ceiling_ms),
        }
    }

    /// Decide whether to retry after a failure.
    ///
    /// `retries_done` is the number of retries already performed for this
    /// operation, so the first failure is decided with `retries_done == 0`.
    pub fn decide(&self, retries_done: u32, error: &ScrapeError) -> RetryDecision {
        if !error.is_transient() || retries_done >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff(retries_done),
        }
    }

    /// Delay before retry number `retry_index` (zero based): `base * multiplier^index`, capped.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let factor = self.multiplier.powi(retry_index.min(i32::MAX as u32) as i32);
        let millis = self.base.as_millis() as f64 * factor;
        let ceiling = self.ceiling.as_millis() as f64;
        if !millis.is_finite() || millis >= ceiling {
            self.ceiling
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> ScrapeError {
        ScrapeError::NavigationTimeout {
            url: "https://shop.example/catalog".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    fn policy(max_attempts: u32, base_ms: u64, multiplier: f64, ceiling_ms: u64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            base_delay_ms: base_ms,
            multiplier,
            ceiling_ms,
        })
    }

    #[test]
    fn test_backoff_sequence_then_give_up() {
        let policy = policy(3, 1_000, 2.0, 60_000);
        let err = timeout();

        let delays: Vec<RetryDecision> = (0..4).map(|n| policy.decide(n, &err)).collect();
        assert_eq!(
            delays,
            vec![
                RetryDecision::Retry { delay: Duration::from_secs(1) },
                RetryDecision::Retry { delay: Duration::from_secs(2) },
                RetryDecision::Retry { delay: Duration::from_secs(4) },
                RetryDecision::GiveUp,
            ]
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy(10, 1_000, 3.0, 5_000);
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(3));
        assert_eq!(policy.backoff(2), Duration::from_secs(5));
        assert_eq!(policy.backoff(200), Duration::from_secs(5));
    }

    #[test]
    fn test_non_transient_errors_are_never_retried() {
        let policy = policy(3, 1_000, 2.0, 60_000);
        assert_eq!(
            policy.decide(0, &ScrapeError::crashed("target closed")),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(0, &ScrapeError::malformed("blank")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_zero_attempts_disables_retry() {
        let policy = policy(0, 1_000, 2.0, 60_000);
        assert_eq!(policy.decide(0, &timeout()), RetryDecision::GiveUp);
    }
}
