//! Retry policy with exponential backoff.
//!
//! The delay after the `n`th failed attempt is `base * 2^n`. With the default
//! one-minute base that is 2, 4, 8 minutes. There is no jitter, so successive
//! retries of one entry always move strictly further out.

use chrono::{DateTime, Duration, Utc};

/// Outcome of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Go back to `pending`, not eligible before the given instant.
    RetryAt(DateTime<Utc>),
    /// Attempts exhausted; the entry is permanently failed.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::minutes(1),
        }
    }
}

impl RetryPolicy {
    /// Delay applied after `attempts` failures (1-indexed).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        // 2^30 keeps the i32 multiplier positive
        let exponent = attempts.min(30);
        let multiplier = 1i32 << exponent;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Decide what happens after a failure that brought the count to `attempts`.
    pub fn decide(&self, attempts: u32, max_attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts < max_attempts {
            let at = now
                .checked_add_signed(self.delay_for(attempts))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            RetryDecision::RetryAt(at)
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::minutes(2));
        assert_eq!(policy.delay_for(2), Duration::minutes(4));
        assert_eq!(policy.delay_for(3), Duration::minutes(8));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(200) >= policy.delay_for(30));
    }

    #[test]
    fn test_decide_retries_until_exhausted() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        assert_eq!(
            policy.decide(1, 3, now),
            RetryDecision::RetryAt(now + Duration::minutes(2))
        );
        assert_eq!(
            policy.decide(2, 3, now),
            RetryDecision::RetryAt(now + Duration::minutes(4))
        );
        assert_eq!(policy.decide(3, 3, now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_times_strictly_increase() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let mut last = now;
        for attempts in 1..10 {
            match policy.decide(attempts, 10, now) {
                RetryDecision::RetryAt(at) => {
                    assert!(at > last);
                    last = at;
                }
                RetryDecision::GiveUp => panic!("should retry below max"),
            }
        }
    }
}
