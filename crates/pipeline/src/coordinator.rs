//! Pipeline coordinator: the façade callers use to submit and retry work.
//!
//! Both `submit` and `retry` run the same dispatch algorithm:
//!
//! 1. `begin_attempt` (atomic check-and-set in the operation log)
//! 2. invoke the gateway method matching the payload
//! 3. on success, `record_success`
//! 4. on failure, `record_failure` (or `record_rejection` for validation
//!    rejections) and, if that exhausted the record, quarantine it before
//!    returning
//!
//! Escalation is quarantine followed by `mark_escalated`. If the dead-letter
//! store is unavailable the exhausted record is still returned, unmarked, and
//! the next sweep pass finishes the escalation.
//!
//! No lock is held across the gateway call. The only thing preventing two
//! attempts on one record is the operation log's state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use marketsync_core::{DeadLetterId, DomainError, OperationId};

use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::error::{PipelineError, StoreError};
use crate::gateway::{self, FailureClass, MarketplaceGateway};
use crate::log::OperationLog;
use crate::operation::{OperationFilter, OperationRecord, OperationState, Pagination};
use crate::payload::{OperationPayload, SubmitRequest};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::stats::{recent_window, PipelineStats};

/// Error detail recorded by the in-flight watchdog.
pub const STUCK_ATTEMPT_DETAIL: &str = "attempt timed out without an outcome";

/// What `retry` does when called before the backoff delay has elapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyRetry {
    /// Fail with `TooEarly`, reporting when the record becomes eligible.
    #[default]
    Reject,
    /// Sleep until the record becomes eligible, then dispatch.
    Defer,
}

impl fmt::Display for EarlyRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EarlyRetry::Reject => f.write_str("reject"),
            EarlyRetry::Defer => f.write_str("defer"),
        }
    }
}

impl FromStr for EarlyRetry {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(EarlyRetry::Reject),
            "defer" => Ok(EarlyRetry::Defer),
            other => Err(DomainError::validation(format!(
                "unknown early retry policy: {other} (expected reject or defer)"
            ))),
        }
    }
}

pub struct PipelineCoordinator {
    log: Arc<dyn OperationLog>,
    dead_letters: Arc<dyn DeadLetterStore>,
    gateway: Arc<dyn MarketplaceGateway>,
    scheduler: RetryScheduler,
    retry_ceiling: u32,
    early_retry: EarlyRetry,
}

impl fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("scheduler", &self.scheduler)
            .field("retry_ceiling", &self.retry_ceiling)
            .field("early_retry", &self.early_retry)
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    pub const DEFAULT_RETRY_CEILING: u32 = 3;

    pub fn new(
        log: Arc<dyn OperationLog>,
        dead_letters: Arc<dyn DeadLetterStore>,
        gateway: Arc<dyn MarketplaceGateway>,
    ) -> Self {
        Self {
            log,
            dead_letters,
            gateway,
            scheduler: RetryScheduler::default(),
            retry_ceiling: Self::DEFAULT_RETRY_CEILING,
            early_retry: EarlyRetry::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: RetryScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Ceiling stamped onto records created from now on.
    pub fn with_retry_ceiling(mut self, retry_ceiling: u32) -> Self {
        self.retry_ceiling = retry_ceiling.max(1);
        self
    }

    /// Policy used by [`retry`](Self::retry).
    pub fn with_early_retry(mut self, early_retry: EarlyRetry) -> Self {
        self.early_retry = early_retry;
        self
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Create a record and make the first attempt before returning.
    ///
    /// Invalid payloads fail with `Validation` and leave no record behind.
    /// Any other outcome, including exhaustion, returns the record.
    pub async fn submit(&self, request: SubmitRequest) -> Result<OperationRecord, PipelineError> {
        let request = request.normalize()?;
        let kind = request.payload.kind();
        let payload_json = request.payload.to_value()?;

        let record = self
            .log
            .create(kind, request.subject_ref, payload_json, self.retry_ceiling)
            .await?;
        info!(
            operation_id = %record.id,
            kind = %kind,
            subject_ref = record.subject_ref.as_deref().unwrap_or(""),
            "operation submitted"
        );

        self.dispatch(record.id, &request.payload).await
    }

    /// One further attempt using the configured early-retry policy.
    pub async fn retry(&self, id: OperationId) -> Result<OperationRecord, PipelineError> {
        self.retry_with(id, self.early_retry).await
    }

    /// One further attempt on a `FailedRetrying` record.
    pub async fn retry_with(
        &self,
        id: OperationId,
        early: EarlyRetry,
    ) -> Result<OperationRecord, PipelineError> {
        let record = self.get(id).await?;

        match self.scheduler.decide(&record, Utc::now()) {
            RetryDecision::RetryNow => {}
            RetryDecision::Wait(remaining) => match early {
                EarlyRetry::Reject => {
                    return Err(PipelineError::TooEarly {
                        id,
                        retry_at: self.scheduler.ready_at(&record),
                    });
                }
                EarlyRetry::Defer => {
                    debug!(operation_id = %id, wait_ms = remaining.as_millis() as u64, "deferring retry");
                    tokio::time::sleep(remaining).await;
                }
            },
            RetryDecision::NotEligible => return Err(not_retryable(&record)),
        }

        let payload = OperationPayload::from_value(&record.request_payload)?;
        info!(operation_id = %id, attempt = record.attempt_count + 1, "retrying operation");
        self.dispatch(id, &payload).await
    }

    async fn dispatch(
        &self,
        id: OperationId,
        payload: &OperationPayload,
    ) -> Result<OperationRecord, PipelineError> {
        let attempt = self.log.begin_attempt(id).await?;
        debug!(operation_id = %id, attempt = attempt.attempt_count, "attempt started");

        match gateway::dispatch(self.gateway.as_ref(), payload).await {
            Ok(receipt) => {
                let record = self
                    .log
                    .record_success(id, receipt.body, receipt.external_ref)
                    .await?;
                info!(
                    operation_id = %id,
                    attempt = record.attempt_count,
                    external_ref = record.external_ref.as_deref().unwrap_or(""),
                    "operation succeeded"
                );
                Ok(record)
            }
            Err(err) => {
                let detail = err.to_string();
                let record = match err.class() {
                    FailureClass::Validation => self.log.record_rejection(id, detail).await?,
                    FailureClass::Transient => self.log.record_failure(id, detail).await?,
                };
                Ok(self.after_failure(record).await)
            }
        }
    }

    /// Log the failure and escalate if it exhausted the record.
    async fn after_failure(&self, record: OperationRecord) -> OperationRecord {
        if record.state != OperationState::FailedExhausted {
            warn!(
                operation_id = %record.id,
                attempt = record.attempt_count,
                retry_ceiling = record.retry_ceiling,
                retry_at = %self.scheduler.ready_at(&record),
                error = record.error_detail.as_deref().unwrap_or(""),
                "operation attempt failed; will retry"
            );
            return record;
        }

        match self.escalate(&record).await {
            Ok(escalated) => escalated,
            Err(e) => {
                error!(
                    operation_id = %record.id,
                    error = %e,
                    "operation exhausted but escalation failed; left for the sweeper"
                );
                record
            }
        }
    }

    /// Quarantine an exhausted record and mark it escalated.
    ///
    /// Safe to repeat: quarantine is idempotent per record, including after
    /// an operator resolved the entry.
    pub async fn escalate(&self, record: &OperationRecord) -> Result<OperationRecord, PipelineError> {
        let entry = self.dead_letters.quarantine(record).await?;
        let marked = self.log.mark_escalated(record.id).await?;
        error!(
            operation_id = %record.id,
            dead_letter_id = %entry.id,
            attempts = record.attempt_count,
            error = record.error_detail.as_deref().unwrap_or(""),
            "operation exhausted its retry budget; quarantined"
        );
        Ok(marked)
    }

    /// Fail every record that has been in flight for longer than `timeout`.
    ///
    /// The gateway offers no cancellation, so a stuck attempt is counted as a
    /// failure and follows the normal retry/escalation path. Records whose
    /// outcome lands between the scan and the update are left alone.
    pub async fn reap_stuck(
        &self,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, PipelineError> {
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| Utc::now().checked_sub_signed(t))
        else {
            return Ok(Vec::new());
        };

        let stuck = self
            .log
            .list_idle(OperationState::InFlight, cutoff, limit)
            .await?;

        let mut reaped = Vec::with_capacity(stuck.len());
        for record in stuck {
            match self
                .log
                .record_failure(record.id, STUCK_ATTEMPT_DETAIL.to_string())
                .await
            {
                Ok(failed) => {
                    warn!(
                        operation_id = %failed.id,
                        in_flight_since = %record.updated_at,
                        "reaped stuck in-flight attempt"
                    );
                    reaped.push(self.after_failure(failed).await);
                }
                Err(StoreError::PreconditionFailed { .. }) | Err(StoreError::ConcurrentAttempt(_)) => {
                    debug!(operation_id = %record.id, "in-flight attempt finished before reaping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reaped)
    }

    pub async fn get(&self, id: OperationId) -> Result<OperationRecord, PipelineError> {
        self.log
            .get(id)
            .await?
            .ok_or(PipelineError::OperationNotFound(id))
    }

    pub async fn list(
        &self,
        filter: OperationFilter,
        pagination: Pagination,
    ) -> Result<Vec<OperationRecord>, PipelineError> {
        Ok(self.log.list(filter, pagination).await?)
    }

    /// `FailedRetrying` records whose backoff has elapsed, most overdue first.
    pub(crate) async fn retry_candidates(
        &self,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, PipelineError> {
        Ok(self.log.list_ready(&self.scheduler, Utc::now(), limit).await?)
    }

    /// Exhausted records whose escalation did not complete.
    pub(crate) async fn unescalated(
        &self,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, PipelineError> {
        Ok(self.log.list_unescalated(limit).await?)
    }

    pub async fn dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        Ok(self.dead_letters.list(pagination).await?)
    }

    pub async fn dead_letter(&self, id: DeadLetterId) -> Result<DeadLetterEntry, PipelineError> {
        self.dead_letters
            .get(id)
            .await?
            .ok_or(PipelineError::DeadLetterNotFound(id))
    }

    /// Manual resolution. The originating record stays `FailedExhausted`.
    pub async fn remove_dead_letter(&self, id: DeadLetterId) -> Result<bool, PipelineError> {
        let removed = self.dead_letters.remove(id).await?;
        if removed {
            info!(dead_letter_id = %id, "dead-letter entry resolved");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<PipelineStats, PipelineError> {
        let since = Utc::now() - recent_window();
        let all = self.log.count_by_state(None).await?;
        let recent = self.log.count_by_state(Some(since)).await?;
        let dead_letters = self.dead_letters.count().await?;
        Ok(PipelineStats::from_counts(&all, &recent, since, dead_letters))
    }
}

fn not_retryable(record: &OperationRecord) -> PipelineError {
    match record.state {
        OperationState::InFlight => PipelineError::ConcurrentAttempt(record.id),
        actual => PipelineError::from(StoreError::PreconditionFailed {
            id: record.id,
            action: "retry",
            actual,
            expected: "failed_retrying",
        }),
    }
}
