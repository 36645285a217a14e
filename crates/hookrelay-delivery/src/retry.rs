//! Polynomial backoff with uniform jitter.
//!
//! After failed attempt `n` the next attempt waits `n^5` seconds plus a
//! uniformly random whole number of seconds in `[30, 600]`. Ten attempts are
//! made in total, so the retry window spans roughly four days.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first.
    pub max_attempts: u32,

    /// Exponent applied to the failed attempt number.
    pub backoff_exponent: u32,

    /// Lower jitter bound, inclusive.
    pub jitter_min: Duration,

    /// Upper jitter bound, inclusive.
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_exponent: 5,
            jitter_min: Duration::from_secs(30),
            jitter_max: Duration::from_secs(600),
        }
    }
}

/// Scheduler's answer to a retry signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run attempt `next_attempt` after `delay`.
    Retry {
        /// Wait before the next attempt.
        delay: Duration,
        /// 1-based number of the next attempt.
        next_attempt: u32,
    },
    /// No further attempts.
    GiveUp {
        /// Why the scheduler stopped.
        reason: String,
    },
}

impl RetryPolicy {
    /// Checks the policy for values that would never retry or never stop.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if self.jitter_min > self.jitter_max {
            return Err(DeliveryError::configuration(format!(
                "jitter range is inverted: {}s > {}s",
                self.jitter_min.as_secs(),
                self.jitter_max.as_secs()
            )));
        }
        Ok(())
    }

    /// Deterministic part of the delay after failed attempt `attempt_number`.
    pub fn base_delay(&self, attempt_number: u32) -> Duration {
        Duration::from_secs(u64::from(attempt_number).saturating_pow(self.backoff_exponent))
    }

    /// Smallest and largest delay the policy can produce after
    /// `attempt_number`.
    pub fn delay_bounds(&self, attempt_number: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt_number);
        (base.saturating_add(self.jitter_min), base.saturating_add(self.jitter_max))
    }

    /// Delay after failed attempt `attempt_number`, with fresh jitter.
    pub fn backoff_delay(&self, attempt_number: u32) -> Duration {
        let jitter =
            rand::rng().random_range(self.jitter_min.as_secs()..=self.jitter_max.as_secs());
        self.base_delay(attempt_number).saturating_add(Duration::from_secs(jitter))
    }

    /// Decides what follows failed attempt `attempt_number` (1-based).
    pub fn decide(&self, attempt_number: u32) -> RetryDecision {
        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.backoff_delay(attempt_number),
            next_attempt: attempt_number + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn tenth_failure_gives_up() {
        let policy = RetryPolicy::default();

        assert!(matches!(policy.decide(9), RetryDecision::Retry { next_attempt: 10, .. }));
        assert!(matches!(policy.decide(10), RetryDecision::GiveUp { .. }));
        assert!(matches!(policy.decide(11), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn base_delay_is_fifth_power() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(32));
        assert_eq!(policy.base_delay(9), Duration::from_secs(59_049));
    }

    #[test]
    fn first_retry_bounds() {
        let (min, max) = RetryPolicy::default().delay_bounds(1);
        assert_eq!(min, Duration::from_secs(31));
        assert_eq!(max, Duration::from_secs(601));
    }

    #[test]
    fn validation_rejects_degenerate_policies() {
        let zero = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert!(zero.validate().is_err());

        let inverted = RetryPolicy {
            jitter_min: Duration::from_secs(10),
            jitter_max: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());

        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
        assert!(matches!(policy.decide(1), RetryDecision::GiveUp { .. }));
    }

    proptest! {
        #[test]
        fn delay_within_bounds(attempt in 1u32..10) {
            let policy = RetryPolicy::default();
            let (min, max) = policy.delay_bounds(attempt);

            match policy.decide(attempt) {
                RetryDecision::Retry { delay, next_attempt } => {
                    prop_assert!(delay >= min && delay <= max);
                    prop_assert!(delay > Duration::from_secs(30));
                    prop_assert_eq!(next_attempt, attempt + 1);
                }
                RetryDecision::GiveUp { .. } => prop_assert!(false, "attempt {} gave up", attempt),
            }
        }

        #[test]
        fn delay_is_whole_seconds(attempt in 1u32..10) {
            let delay = RetryPolicy::default().backoff_delay(attempt);
            prop_assert_eq!(delay.subsec_nanos(), 0);
        }
    }
}
