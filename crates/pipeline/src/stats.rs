//! Read-only aggregation over the operation log for admin tooling.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::operation::OperationState;

/// Number of records per lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts(HashMap<OperationState, u64>);

impl StateCounts {
    pub fn add(&mut self, state: OperationState, n: u64) {
        *self.0.entry(state).or_insert(0) += n;
    }

    pub fn get(&self, state: OperationState) -> u64 {
        self.0.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

/// Success/failure breakdown for a recent window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub since: Option<DateTime<Utc>>,
    pub succeeded: u64,
    /// Failed records, retrying or exhausted.
    pub failed: u64,
}

/// Pipeline health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub total: u64,
    pub pending: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed_retrying: u64,
    pub failed_exhausted: u64,
    /// Open dead-letter entries (operator resolution shrinks this, not
    /// `failed_exhausted`).
    pub dead_letters: u64,
    pub last_24h: WindowStats,
}

/// Length of the "recent" window.
pub fn recent_window() -> Duration {
    Duration::hours(24)
}

impl PipelineStats {
    pub fn from_counts(
        all: &StateCounts,
        recent: &StateCounts,
        since: DateTime<Utc>,
        dead_letters: u64,
    ) -> Self {
        Self {
            total: all.total(),
            pending: all.get(OperationState::Pending),
            in_flight: all.get(OperationState::InFlight),
            succeeded: all.get(OperationState::Succeeded),
            failed_retrying: all.get(OperationState::FailedRetrying),
            failed_exhausted: all.get(OperationState::FailedExhausted),
            dead_letters,
            last_24h: WindowStats {
                since: Some(since),
                succeeded: recent.get(OperationState::Succeeded),
                failed: recent.get(OperationState::FailedRetrying)
                    + recent.get(OperationState::FailedExhausted),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_snapshot_from_counts() {
        let mut all = StateCounts::default();
        all.add(OperationState::Succeeded, 5);
        all.add(OperationState::FailedRetrying, 2);
        all.add(OperationState::FailedExhausted, 1);
        all.add(OperationState::Pending, 1);

        let mut recent = StateCounts::default();
        recent.add(OperationState::Succeeded, 3);
        recent.add(OperationState::FailedExhausted, 1);

        let since = Utc::now() - recent_window();
        let stats = PipelineStats::from_counts(&all, &recent, since, 1);

        assert_eq!(stats.total, 9);
        assert_eq!(stats.succeeded, 5);
        assert_eq!(stats.failed_retrying, 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dead_letters, 1);
        assert_eq!(stats.last_24h.succeeded, 3);
        assert_eq!(stats.last_24h.failed, 1);
        assert_eq!(stats.last_24h.since, Some(since));
    }
}
