//! Retry policy: bounded exponential backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);

/// Default delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1800);

/// Default retry budget for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry policy configuration.
///
/// `delay = min(base × 2^(retry_count - 1), max)`. With the defaults this gives
/// 30s, 60s, 120s, 240s, 480s, 960s and then 1800s for every later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Retry budget given to new jobs.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Outcome of consulting the policy after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// Eligible for re-admission once `at` has passed.
    RetryAt(DateTime<Utc>),
    /// Retry budget spent; the job is dead-lettered.
    Exhausted,
}

impl RetryDecision {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryDecision::RetryAt(_))
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RetryDecision::RetryAt(at) => Some(*at),
            RetryDecision::Exhausted => None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Calculate the delay after the `retry_count`-th failure (1-indexed).
    ///
    /// `retry_count == 0` means nothing failed yet and yields zero.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let exponent = retry_count - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Check if more retries are allowed after `retry_count` failures.
    pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// Decide what happens after the `retry_count`-th failure at `now`.
    pub fn decide(&self, retry_count: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if !Self::should_retry(retry_count, max_retries) {
            return RetryDecision::Exhausted;
        }
        let delay = chrono::Duration::from_std(self.delay_for_attempt(retry_count))
            .unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(delay) {
            Some(at) => RetryDecision::RetryAt(at),
            None => RetryDecision::RetryAt(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn default_backoff_matches_schedule() {
        let policy = RetryPolicy::default();
        let expected = [30, 60, 120, 240, 480, 960, 1800];

        for (i, secs) in expected.iter().enumerate() {
            let retry_count = (i + 1) as u32;
            assert_eq!(
                policy.delay_for_attempt(retry_count),
                Duration::from_secs(*secs),
                "retry_count={retry_count}"
            );
        }
    }

    #[test]
    fn seventh_attempt_is_capped_not_doubled() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(1800));
        assert_ne!(policy.delay_for_attempt(7), Duration::from_secs(1920));
    }

    #[test]
    fn zero_attempts_have_no_delay() {
        assert_eq!(RetryPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(1800));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1800));
    }

    #[test]
    fn should_retry_respects_budget() {
        assert!(RetryPolicy::should_retry(1, 3));
        assert!(RetryPolicy::should_retry(2, 3));
        assert!(!RetryPolicy::should_retry(3, 3));
        assert!(!RetryPolicy::should_retry(0, 0));
    }

    #[test]
    fn decide_schedules_from_now() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(2, 3, now),
            RetryDecision::RetryAt(now + chrono::Duration::seconds(60))
        );
        assert_eq!(policy.decide(3, 3, now), RetryDecision::Exhausted);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: delays never decrease and never exceed the cap.
        #[test]
        fn backoff_is_monotonic_and_capped(retry_count in 1u32..200) {
            let policy = RetryPolicy::default();
            let current = policy.delay_for_attempt(retry_count);
            let next = policy.delay_for_attempt(retry_count + 1);

            prop_assert!(current <= next);
            prop_assert!(next <= policy.max_delay);
        }
    }
}
