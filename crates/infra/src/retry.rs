//! Retry policy: capped exponential backoff.
//!
//! Used by the outbox dispatcher (enqueue failures) and the job queue
//! (handler failures); the two ladders are independent by design.

use std::time::Duration;

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed (0 = no retries).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Outbox defaults: 5 attempts, 1 s base, 5 min cap.
    pub fn outbox_default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Queue defaults: 3 attempts, 1 s base.
    pub fn queue_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Delay after `failures` observed failures: `base * 2^failures`,
    /// capped at `max_delay`.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.max_delay.as_millis() as u64;
        let factor = 2u64.checked_pow(failures).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::outbox_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_doubles_per_failure() {
        let policy = RetryPolicy::outbox_default();
        assert_eq!(policy.backoff_after(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::outbox_default();
        assert_eq!(policy.backoff_after(9), Duration::from_secs(300));
        assert_eq!(policy.backoff_after(40), Duration::from_secs(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::queue_default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(failures in 0u32..1024) {
            let policy = RetryPolicy::outbox_default();
            prop_assert!(policy.backoff_after(failures) <= policy.max_delay);
        }

        #[test]
        fn backoff_is_monotone_up_to_cap(failures in 0u32..62) {
            let policy = RetryPolicy::outbox_default();
            prop_assert!(policy.backoff_after(failures) <= policy.backoff_after(failures + 1));
        }
    }
}
