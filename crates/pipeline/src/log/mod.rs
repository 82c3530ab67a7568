//! Operation log: the durable record of every submitted operation.
//!
//! All mutations are conditional on the record's current state. In
//! particular `begin_attempt` is an atomic check-and-set, which makes
//! at-most-one-attempt-in-flight a property of the log rather than of the
//! workers driving it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use marketsync_core::OperationId;

use crate::error::StoreError;
use crate::operation::{OperationFilter, OperationKind, OperationRecord, OperationState, Pagination};
use crate::retry::RetryScheduler;
use crate::stats::StateCounts;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryOperationLog;
pub use postgres::PostgresOperationLog;

/// Operation log abstraction.
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Create a `Pending` record with `attempt_count = 0`.
    async fn create(
        &self,
        kind: OperationKind,
        subject_ref: Option<String>,
        request_payload: JsonValue,
        retry_ceiling: u32,
    ) -> Result<OperationRecord, StoreError>;

    /// `Pending | FailedRetrying → InFlight`, incrementing `attempt_count`.
    ///
    /// Fails with `ConcurrentAttempt` if the record is already in flight and
    /// with `PreconditionFailed` if it is terminal.
    async fn begin_attempt(&self, id: OperationId) -> Result<OperationRecord, StoreError>;

    /// `InFlight → Succeeded`.
    async fn record_success(
        &self,
        id: OperationId,
        response_payload: JsonValue,
        external_ref: Option<String>,
    ) -> Result<OperationRecord, StoreError>;

    /// `InFlight → FailedRetrying`, or `FailedExhausted` at the ceiling.
    async fn record_failure(
        &self,
        id: OperationId,
        error_detail: String,
    ) -> Result<OperationRecord, StoreError>;

    /// `InFlight → FailedExhausted` without consuming the remaining budget.
    async fn record_rejection(
        &self,
        id: OperationId,
        error_detail: String,
    ) -> Result<OperationRecord, StoreError>;

    async fn get(&self, id: OperationId) -> Result<Option<OperationRecord>, StoreError>;

    /// Records matching `filter`, most recently created first.
    async fn list(
        &self,
        filter: OperationFilter,
        pagination: Pagination,
    ) -> Result<Vec<OperationRecord>, StoreError>;

    /// Records in `state` last touched before `updated_before`, oldest first.
    ///
    /// Drives the retry sweep (`FailedRetrying`) and the in-flight watchdog
    /// (`InFlight`).
    async fn list_idle(
        &self,
        state: OperationState,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, StoreError>;

    /// `FailedRetrying` records whose backoff under `backoff` has elapsed by
    /// `now`, most overdue first.
    ///
    /// Readiness is decided by the store so that records still backing off
    /// never occupy a slot of `limit`.
    async fn list_ready(
        &self,
        backoff: &RetryScheduler,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, StoreError>;

    /// Note that the dead-letter entry for an exhausted record exists.
    /// Idempotent; fails with `PreconditionFailed` for any other state.
    async fn mark_escalated(&self, id: OperationId) -> Result<OperationRecord, StoreError>;

    /// `FailedExhausted` records with no escalation mark, oldest first.
    async fn list_unescalated(&self, limit: u32) -> Result<Vec<OperationRecord>, StoreError>;

    /// Record counts per state, optionally restricted to records created at
    /// or after `created_since`.
    async fn count_by_state(
        &self,
        created_since: Option<DateTime<Utc>>,
    ) -> Result<StateCounts, StoreError>;
}
