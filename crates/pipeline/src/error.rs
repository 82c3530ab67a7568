//! Error types for the delivery pipeline.

use chrono::{DateTime, Utc};
use thiserror::Error;

use marketsync_core::{DeadLetterId, DomainError, OperationId};

use crate::operation::OperationState;

/// Store-level error shared by the operation log and the dead-letter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("operation not found: {0}")]
    NotFound(OperationId),

    /// The record is not in a state that allows the requested transition.
    #[error("operation {id} is {actual}; {action} requires {expected}")]
    PreconditionFailed {
        id: OperationId,
        action: &'static str,
        actual: OperationState,
        expected: &'static str,
    },

    /// Another caller already moved the record to `in_flight`.
    #[error("operation {0} already has an attempt in flight")]
    ConcurrentAttempt(OperationId),

    #[error("operation already exists: {0}")]
    AlreadyExists(OperationId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Error surfaced by the pipeline coordinator to its callers.
///
/// Exhausting the retry budget is *not* an error: `submit`/`retry` return the
/// record and callers inspect its state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Payload malformed before dispatch. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal state transition (e.g. retrying a succeeded record).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Lost the race for `begin_attempt`; the winning attempt is in flight.
    #[error("operation {0} already has an attempt in flight")]
    ConcurrentAttempt(OperationId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    /// Retry requested before the backoff delay elapsed.
    #[error("operation {id} may not be retried before {retry_at}")]
    TooEarly {
        id: OperationId,
        retry_at: DateTime<Utc>,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => PipelineError::OperationNotFound(id),
            e @ StoreError::PreconditionFailed { .. } => PipelineError::PreconditionFailed(e.to_string()),
            StoreError::ConcurrentAttempt(id) => PipelineError::ConcurrentAttempt(id),
            StoreError::AlreadyExists(id) => {
                PipelineError::Storage(format!("operation already exists: {id}"))
            }
            StoreError::Storage(msg) => PipelineError::Storage(msg),
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => PipelineError::Validation(msg),
            DomainError::InvalidId(msg) => PipelineError::Validation(msg),
        }
    }
}
