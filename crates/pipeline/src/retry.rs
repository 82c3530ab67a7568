//! Retry scheduling: backoff delays and retry eligibility.
//!
//! The scheduler is stateless. Every decision is a function of the record's
//! counters and timestamps, so it can never disagree with the operation log.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::{OperationRecord, OperationState};

/// Exponential backoff: `base_delay * 2^attempt_count`.
///
/// There is no upper bound unless `max_delay` is set. The cap is a tunable
/// for deployments with large retry ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryScheduler {
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

/// What to do with a record right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Backoff has elapsed; dispatch again.
    RetryNow,
    /// Eligible, but the backoff has not elapsed yet.
    Wait(Duration),
    /// Not in `FailedRetrying` (pending, in flight, or terminal).
    NotEligible,
}

impl RetryScheduler {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
        }
    }

    /// Cap every computed delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay to wait after a failure, given the attempts made so far.
    ///
    /// Saturates at `Duration::MAX` (or the cap) instead of overflowing.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_count).unwrap_or(0);
        let delay = if factor == 0 {
            if self.base_delay.is_zero() {
                Duration::ZERO
            } else {
                Duration::MAX
            }
        } else {
            self.base_delay.saturating_mul(factor)
        };

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// True iff the record may be dispatched again.
    pub fn should_retry(&self, record: &OperationRecord) -> bool {
        record.state == OperationState::FailedRetrying && record.attempt_count < record.retry_ceiling
    }

    /// Earliest instant at which the record may be retried.
    pub fn ready_at(&self, record: &OperationRecord) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.next_delay(record.attempt_count))
            .unwrap_or(chrono::Duration::MAX);
        record
            .updated_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn decide(&self, record: &OperationRecord, now: DateTime<Utc>) -> RetryDecision {
        if !self.should_retry(record) {
            return RetryDecision::NotEligible;
        }

        let ready_at = self.ready_at(record);
        if now >= ready_at {
            RetryDecision::RetryNow
        } else {
            RetryDecision::Wait((ready_at - now).to_std().unwrap_or(Duration::ZERO))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use proptest::prelude::*;

    fn failed_record(attempts: u32, ceiling: u32) -> OperationRecord {
        let mut r = OperationRecord::new(
            OperationKind::FetchOrders,
            None,
            serde_json::json!({"kind": "fetch_orders"}),
            ceiling,
        );
        for _ in 0..attempts {
            r.begin_attempt(Utc::now()).unwrap();
            r.record_failure("down", Utc::now()).unwrap();
        }
        r
    }

    #[test]
    fn exponential_backoff_doubles() {
        let s = RetryScheduler::new(Duration::from_millis(100));
        assert_eq!(s.next_delay(0), Duration::from_millis(100));
        assert_eq!(s.next_delay(1), Duration::from_millis(200));
        assert_eq!(s.next_delay(2), Duration::from_millis(400));
        assert_eq!(s.next_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn cap_is_opt_in() {
        let s = RetryScheduler::new(Duration::from_secs(1));
        assert_eq!(s.next_delay(10), Duration::from_secs(1024));

        let capped = s.with_max_delay(Duration::from_secs(60));
        assert_eq!(capped.next_delay(10), Duration::from_secs(60));
        assert_eq!(capped.next_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn huge_exponents_saturate() {
        let s = RetryScheduler::default();
        assert_eq!(s.next_delay(64), Duration::MAX);
        assert_eq!(RetryScheduler::new(Duration::ZERO).next_delay(64), Duration::ZERO);
    }

    #[test]
    fn only_failed_retrying_is_eligible() {
        let s = RetryScheduler::new(Duration::ZERO);
        assert!(!s.should_retry(&failed_record(0, 3)));
        assert!(s.should_retry(&failed_record(1, 3)));
        assert!(s.should_retry(&failed_record(2, 3)));
        assert!(!s.should_retry(&failed_record(3, 3)));
    }

    #[test]
    fn decide_waits_for_backoff() {
        let s = RetryScheduler::new(Duration::from_secs(10));
        let r = failed_record(1, 3);

        match s.decide(&r, r.updated_at) {
            RetryDecision::Wait(d) => assert_eq!(d, Duration::from_secs(20)),
            other => panic!("expected wait, got {other:?}"),
        }
        assert_eq!(
            s.decide(&r, r.updated_at + chrono::Duration::seconds(20)),
            RetryDecision::RetryNow
        );
        assert_eq!(s.decide(&failed_record(3, 3), Utc::now()), RetryDecision::NotEligible);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic(base_ms in 0u64..10_000, n in 0u32..80) {
            let s = RetryScheduler::new(Duration::from_millis(base_ms));
            prop_assert!(s.next_delay(n + 1) >= s.next_delay(n));
        }

        #[test]
        fn capped_backoff_is_monotonic_and_bounded(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..1_000_000,
            n in 0u32..80,
        ) {
            let cap = Duration::from_millis(cap_ms);
            let s = RetryScheduler::new(Duration::from_millis(base_ms)).with_max_delay(cap);
            prop_assert!(s.next_delay(n + 1) >= s.next_delay(n));
            prop_assert!(s.next_delay(n) <= cap);
        }
    }
}
