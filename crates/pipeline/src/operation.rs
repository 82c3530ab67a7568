//! Operation records: the unit of storage of the operation log.
//!
//! A record is created once per logical unit of work and mutated only through
//! the transition methods below. Stores apply these transitions atomically
//! (under a write lock, or as a single conditional `UPDATE`).
//!
//! ```text
//! Pending ──begin──▶ InFlight ──success──▶ Succeeded
//!                      │  ▲
//!              failure │  │ begin (retry)
//!                      ▼  │
//!               FailedRetrying
//!                      │
//!   failure at ceiling │ or rejection
//!                      ▼
//!               FailedExhausted
//! ```

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketsync_core::{DomainError, OperationId};

use crate::error::StoreError;

/// Closed set of remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateListing,
    UpdateInventory,
    UpdatePrice,
    FetchOrders,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::CreateListing,
        OperationKind::UpdateInventory,
        OperationKind::UpdatePrice,
        OperationKind::FetchOrders,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateListing => "create_listing",
            OperationKind::UpdateInventory => "update_inventory",
            OperationKind::UpdatePrice => "update_price",
            OperationKind::FetchOrders => "fetch_orders",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown operation kind: {s}")))
    }
}

/// Lifecycle state of an operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Created, not yet attempted.
    Pending,
    /// Attempt dispatched to the gateway.
    InFlight,
    /// Terminal success.
    Succeeded,
    /// Last attempt failed; eligible for re-dispatch.
    FailedRetrying,
    /// Terminal failure; mirrored into the dead-letter store.
    FailedExhausted,
}

impl OperationState {
    pub const ALL: [OperationState; 5] = [
        OperationState::Pending,
        OperationState::InFlight,
        OperationState::Succeeded,
        OperationState::FailedRetrying,
        OperationState::FailedExhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InFlight => "in_flight",
            OperationState::Succeeded => "succeeded",
            OperationState::FailedRetrying => "failed_retrying",
            OperationState::FailedExhausted => "failed_exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::FailedExhausted)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown operation state: {s}")))
    }
}

/// Durable record of one submitted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Domain entity the operation concerns (e.g. a product id).
    pub subject_ref: Option<String>,
    /// Identifier assigned by the marketplace once it acknowledged the call.
    pub external_ref: Option<String>,
    pub state: OperationState,
    /// Immutable; every attempt reuses it verbatim.
    pub request_payload: JsonValue,
    /// Body of the last gateway response.
    pub response_payload: Option<JsonValue>,
    /// Message of the most recent failure; cleared on success.
    pub error_detail: Option<String>,
    pub attempt_count: u32,
    pub retry_ceiling: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once the dead-letter entry for an exhausted record exists.
    /// `FailedExhausted` with no mark means escalation is still owed.
    #[serde(default)]
    pub escalated_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    /// Create a pending record. A ceiling below 1 is raised to 1 so that every
    /// record gets at least one attempt.
    pub fn new(
        kind: OperationKind,
        subject_ref: Option<String>,
        request_payload: JsonValue,
        retry_ceiling: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            kind,
            subject_ref,
            external_ref: None,
            state: OperationState::Pending,
            request_payload,
            response_payload: None,
            error_detail: None,
            attempt_count: 0,
            retry_ceiling: retry_ceiling.max(1),
            created_at: now,
            updated_at: now,
            completed_at: None,
            escalated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check that `begin_attempt` is legal in the current state.
    pub fn check_can_begin(&self) -> Result<(), StoreError> {
        match self.state {
            OperationState::Pending | OperationState::FailedRetrying
                if self.attempt_count < self.retry_ceiling =>
            {
                Ok(())
            }
            OperationState::InFlight => Err(StoreError::ConcurrentAttempt(self.id)),
            actual => Err(StoreError::PreconditionFailed {
                id: self.id,
                action: "begin_attempt",
                actual,
                expected: "pending or failed_retrying",
            }),
        }
    }

    /// Check that an outcome may be recorded (the record must be in flight).
    pub fn check_in_flight(&self, action: &'static str) -> Result<(), StoreError> {
        if self.state == OperationState::InFlight {
            Ok(())
        } else {
            Err(StoreError::PreconditionFailed {
                id: self.id,
                action,
                actual: self.state,
                expected: "in_flight",
            })
        }
    }

    pub fn check_exhausted(&self, action: &'static str) -> Result<(), StoreError> {
        if self.state == OperationState::FailedExhausted {
            Ok(())
        } else {
            Err(StoreError::PreconditionFailed {
                id: self.id,
                action,
                actual: self.state,
                expected: "failed_exhausted",
            })
        }
    }

    /// Pending/FailedRetrying → InFlight, counting the attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_can_begin()?;
        self.state = OperationState::InFlight;
        self.attempt_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// InFlight → Succeeded.
    pub fn record_success(
        &mut self,
        response_payload: JsonValue,
        external_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_in_flight("record_success")?;
        self.state = OperationState::Succeeded;
        self.response_payload = Some(response_payload);
        if external_ref.is_some() {
            self.external_ref = external_ref;
        }
        self.error_detail = None;
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// InFlight → FailedRetrying, or FailedExhausted once the ceiling is reached.
    pub fn record_failure(
        &mut self,
        error_detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_in_flight("record_failure")?;
        self.error_detail = Some(error_detail.into());
        self.updated_at = now;
        if self.attempt_count < self.retry_ceiling {
            self.state = OperationState::FailedRetrying;
        } else {
            self.state = OperationState::FailedExhausted;
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// InFlight → FailedExhausted regardless of remaining budget (the
    /// marketplace rejected the payload; retrying cannot help).
    pub fn record_rejection(
        &mut self,
        error_detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_in_flight("record_rejection")?;
        self.error_detail = Some(error_detail.into());
        self.state = OperationState::FailedExhausted;
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Stamp `escalated_at` on an exhausted record. Keeps the first stamp.
    pub fn mark_escalated(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_exhausted("mark_escalated")?;
        self.escalated_at.get_or_insert(now);
        Ok(())
    }

    pub fn awaits_escalation(&self) -> bool {
        self.state == OperationState::FailedExhausted && self.escalated_at.is_none()
    }
}

/// Filter for listing operation records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFilter {
    pub state: Option<OperationState>,
    pub kind: Option<OperationKind>,
}

impl OperationFilter {
    pub fn by_state(state: OperationState) -> Self {
        Self {
            state: Some(state),
            kind: None,
        }
    }

    pub fn matches(&self, record: &OperationRecord) -> bool {
        self.state.is_none_or(|s| record.state == s) && self.kind.is_none_or(|k| record.kind == k)
    }
}

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of items to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }

    /// Apply to an already-ordered collection.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ceiling: u32) -> OperationRecord {
        OperationRecord::new(
            OperationKind::UpdateInventory,
            Some("product-1".into()),
            serde_json::json!({"sku": "SKU-1", "quantity": 3}),
            ceiling,
        )
    }

    #[test]
    fn success_path_sets_completion() {
        let mut r = record(3);
        let now = Utc::now();
        r.begin_attempt(now).unwrap();
        assert_eq!(r.state, OperationState::InFlight);
        assert_eq!(r.attempt_count, 1);

        r.record_success(serde_json::json!({"ok": true}), Some("FEED_1".into()), now)
            .unwrap();
        assert_eq!(r.state, OperationState::Succeeded);
        assert_eq!(r.external_ref.as_deref(), Some("FEED_1"));
        assert_eq!(r.completed_at, Some(now));
        assert!(r.error_detail.is_none());
    }

    #[test]
    fn failure_retries_until_ceiling_then_exhausts() {
        let mut r = record(2);
        let now = Utc::now();

        r.begin_attempt(now).unwrap();
        r.record_failure("boom 1", now).unwrap();
        assert_eq!(r.state, OperationState::FailedRetrying);
        assert!(r.completed_at.is_none());

        r.begin_attempt(now).unwrap();
        r.record_failure("boom 2", now).unwrap();
        assert_eq!(r.state, OperationState::FailedExhausted);
        assert_eq!(r.attempt_count, 2);
        assert_eq!(r.error_detail.as_deref(), Some("boom 2"));
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn terminal_records_reject_further_attempts() {
        let mut r = record(1);
        let now = Utc::now();
        r.begin_attempt(now).unwrap();
        r.record_success(serde_json::json!({}), None, now).unwrap();

        let before = r.clone();
        let err = r.begin_attempt(now).unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
        assert_eq!(r, before);
    }

    #[test]
    fn second_begin_while_in_flight_is_a_concurrent_attempt() {
        let mut r = record(3);
        r.begin_attempt(Utc::now()).unwrap();
        assert_eq!(
            r.begin_attempt(Utc::now()).unwrap_err(),
            StoreError::ConcurrentAttempt(r.id)
        );
        assert_eq!(r.attempt_count, 1);
    }

    #[test]
    fn outcomes_require_in_flight() {
        let mut r = record(3);
        assert!(r.record_failure("x", Utc::now()).is_err());
        assert!(r.record_success(serde_json::json!({}), None, Utc::now()).is_err());
        assert!(r.record_rejection("x", Utc::now()).is_err());
        assert_eq!(r.state, OperationState::Pending);
    }

    #[test]
    fn rejection_exhausts_immediately() {
        let mut r = record(3);
        r.begin_attempt(Utc::now()).unwrap();
        r.record_rejection("unknown sku", Utc::now()).unwrap();
        assert_eq!(r.state, OperationState::FailedExhausted);
        assert_eq!(r.attempt_count, 1);
    }

    #[test]
    fn escalation_mark_needs_exhaustion_and_keeps_first_stamp() {
        let mut r = record(1);
        assert!(r.mark_escalated(Utc::now()).is_err());

        r.begin_attempt(Utc::now()).unwrap();
        r.record_failure("503", Utc::now()).unwrap();
        assert!(r.awaits_escalation());

        let first = Utc::now();
        r.mark_escalated(first).unwrap();
        r.mark_escalated(first + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(r.escalated_at, Some(first));
        assert!(!r.awaits_escalation());
    }

    #[test]
    fn zero_ceiling_is_raised_to_one() {
        assert_eq!(record(0).retry_ceiling, 1);
    }

    #[test]
    fn kind_and_state_round_trip_through_strings() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        for state in OperationState::ALL {
            assert_eq!(state.as_str().parse::<OperationState>().unwrap(), state);
        }
        assert!("delete_listing".parse::<OperationKind>().is_err());
    }

    #[test]
    fn filter_matches_on_state_and_kind() {
        let r = record(3);
        assert!(OperationFilter::default().matches(&r));
        assert!(OperationFilter::by_state(OperationState::Pending).matches(&r));
        assert!(!OperationFilter::by_state(OperationState::Succeeded).matches(&r));
        let f = OperationFilter {
            state: None,
            kind: Some(OperationKind::FetchOrders),
        };
        assert!(!f.matches(&r));
    }

    #[test]
    fn pagination_caps_limit_and_skips() {
        let p = Pagination::new(Some(5000), Some(2));
        assert_eq!(p.limit, 1000);
        let page = Pagination::new(Some(2), Some(1)).apply(vec![1, 2, 3, 4]);
        assert_eq!(page, vec![2, 3]);
    }
}
