//! Exponential backoff retry decisions.
//!
//! Policies are derived from each destination's `retry_enabled`,
//! `max_retries` and `retry_delay_ms_base`. The delay after the n-th failed
//! attempt is `base * 2^(n-1)`, capped at five minutes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracerelay_core::Destination;

/// Upper bound on any single backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Retry policy for one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failed attempts are retried at all.
    pub retry_enabled: bool,

    /// Failed attempts after which the record fails permanently.
    pub max_attempts: u32,

    /// Base delay for exponential backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: MAX_RETRY_DELAY,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Builds the policy configured on a destination.
    ///
    /// Negative configuration values are treated as zero.
    pub fn for_destination(destination: &Destination, jitter_factor: f64) -> Self {
        Self {
            retry_enabled: destination.retry_enabled,
            max_attempts: u32::try_from(destination.max_retries).unwrap_or(0),
            base_delay: Duration::from_millis(
                u64::try_from(destination.retry_delay_ms_base).unwrap_or(0),
            ),
            max_delay: MAX_RETRY_DELAY,
            jitter_factor,
        }
    }

    /// Returns true once `attempts` has reached the cap.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Failed attempts including the one just made (1-based).
    pub attempts: u32,
    /// Whether the failure can never succeed on retry.
    pub permanent: bool,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery at the specified time.
    Retry {
        /// When the next attempt becomes due
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry; the record fails.
    GiveUp {
        /// Why no retry is scheduled
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempts: u32,
        permanent: bool,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempts, permanent, failed_at, policy }
    }

    /// Determines if and when to retry.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.permanent {
            return RetryDecision::GiveUp { reason: "permanent failure".to_string() };
        }

        if !self.policy.retry_enabled {
            return RetryDecision::GiveUp { reason: "retries disabled".to_string() };
        }

        if self.policy.is_exhausted(self.attempts) {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.policy.max_attempts),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    /// Calculates the delay until the next attempt, jitter included.
    pub fn calculate_delay(&self) -> Duration {
        let delay = backoff_delay(self.policy.base_delay, self.attempts, self.policy.max_delay);
        std::cmp::min(apply_jitter(delay, self.policy.jitter_factor), self.policy.max_delay)
    }
}

/// Un-jittered exponential backoff after `attempts` failures.
///
/// `min(base * 2^(attempts-1), max_delay)`; zero attempts is treated as one.
pub fn backoff_delay(base_delay: Duration, attempts: u32, max_delay: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    let multiplier = 2_u32.saturating_pow(exponent);
    std::cmp::min(base_delay.saturating_mul(multiplier), max_delay)
}

/// Randomizes a delay by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, ..Default::default() }
    }

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let delays: Vec<_> = (1..=5)
            .map(|attempts| backoff_delay(Duration::from_millis(1000), attempts, MAX_RETRY_DELAY))
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(16000),
            ]
        );
    }

    #[test]
    fn backoff_is_capped_at_five_minutes() {
        assert_eq!(
            backoff_delay(Duration::from_millis(1000), 10, MAX_RETRY_DELAY),
            Duration::from_millis(300_000)
        );
        assert_eq!(
            backoff_delay(Duration::from_millis(1000), u32::MAX, MAX_RETRY_DELAY),
            MAX_RETRY_DELAY
        );
    }

    #[test]
    fn retries_until_attempt_cap() {
        let now = Utc::now();
        for attempts in 1..5 {
            let decision = RetryContext::new(attempts, false, now, policy(5)).decide_retry();
            assert!(matches!(decision, RetryDecision::Retry { .. }), "attempt {attempts}");
        }

        match RetryContext::new(5, false, now, policy(5)).decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("should give up at the cap"),
        }
    }

    #[test]
    fn retry_time_is_failure_time_plus_delay() {
        let now = Utc::now();
        let decision = RetryContext::new(3, false, now, policy(5)).decide_retry();
        assert_eq!(
            decision,
            RetryDecision::Retry { next_attempt_at: now + chrono::Duration::milliseconds(4000) }
        );
    }

    #[test]
    fn permanent_failures_and_disabled_retries_give_up() {
        let now = Utc::now();
        assert!(matches!(
            RetryContext::new(1, true, now, policy(5)).decide_retry(),
            RetryDecision::GiveUp { .. }
        ));

        let disabled = RetryPolicy { retry_enabled: false, ..policy(5) };
        assert!(matches!(
            RetryContext::new(1, false, now, disabled).decide_retry(),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            seen.insert(jittered.as_millis());
            assert!(jittered >= Duration::from_secs(5));
            assert!(jittered <= Duration::from_secs(15));
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(base_ms in 0u64..100_000, attempts in 1u32..64) {
            let base = Duration::from_millis(base_ms);
            let current = backoff_delay(base, attempts, MAX_RETRY_DELAY);
            let next = backoff_delay(base, attempts + 1, MAX_RETRY_DELAY);

            prop_assert!(current <= next);
            prop_assert!(next <= MAX_RETRY_DELAY);
        }

        #[test]
        fn uncapped_backoff_matches_formula(base_ms in 1u64..1_000, attempts in 1u32..8) {
            let expected = Duration::from_millis(base_ms * 2u64.pow(attempts - 1));
            prop_assert_eq!(
                backoff_delay(Duration::from_millis(base_ms), attempts, MAX_RETRY_DELAY),
                expected
            );
        }
    }
}
