//! Dead-letter store: quarantine for operations that exhausted their budget.
//!
//! Entries are created only when a record reaches `FailedExhausted` and are
//! resolved only by an operator. Resolving an entry never touches the
//! originating record, which stays `FailedExhausted` for audit.
//!
//! Resolution hides the entry from every read but the store remembers it, so
//! a late or repeated `quarantine` for the same record cannot reopen it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketsync_core::{DeadLetterId, OperationId};

use crate::error::StoreError;
use crate::operation::{OperationKind, OperationRecord, OperationState, Pagination};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryDeadLetterStore;
pub use postgres::PostgresDeadLetterStore;

/// Snapshot of an exhausted operation, taken at escalation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub error_detail: String,
    pub request_payload: JsonValue,
    pub attempt_count: u32,
    pub quarantined_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Snapshot an exhausted record. Any other state is a precondition failure.
    pub fn from_record(record: &OperationRecord) -> Result<Self, StoreError> {
        if record.state != OperationState::FailedExhausted {
            return Err(StoreError::PreconditionFailed {
                id: record.id,
                action: "quarantine",
                actual: record.state,
                expected: "failed_exhausted",
            });
        }

        Ok(Self {
            id: DeadLetterId::new(),
            operation_id: record.id,
            kind: record.kind,
            error_detail: record
                .error_detail
                .clone()
                .unwrap_or_else(|| "retry budget exhausted".to_string()),
            request_payload: record.request_payload.clone(),
            attempt_count: record.attempt_count,
            quarantined_at: Utc::now(),
        })
    }
}

/// Dead-letter store abstraction.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Quarantine an exhausted record.
    ///
    /// Idempotent per originating record: a second call returns the entry
    /// created by the first, even after an operator resolved it.
    async fn quarantine(&self, record: &OperationRecord) -> Result<DeadLetterEntry, StoreError>;

    /// Entries, most recently quarantined first.
    async fn list(&self, pagination: Pagination) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError>;

    async fn find_by_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Manual resolution. Returns `false` for an unknown or already resolved
    /// id instead of failing.
    async fn remove(&self, id: DeadLetterId) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}
