//! In-memory operation log for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use marketsync_core::OperationId;

use crate::error::StoreError;
use crate::operation::{OperationFilter, OperationKind, OperationRecord, OperationState, Pagination};
use crate::retry::RetryScheduler;
use crate::stats::StateCounts;

use super::OperationLog;

/// Operation log backed by a `HashMap`.
///
/// Every transition runs under the single write lock, so check-and-set is
/// trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryOperationLog {
    records: RwLock<HashMap<OperationId, OperationRecord>>,
}

impl InMemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully-formed record (fixtures and imports).
    pub fn insert(&self, record: OperationRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    fn mutate<F>(&self, id: OperationId, f: F) -> Result<OperationRecord, StoreError>
    where
        F: FnOnce(&mut OperationRecord, DateTime<Utc>) -> Result<(), StoreError>,
    {
        let mut records = self.records.write().map_err(poisoned)?;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Apply to a copy so a failed precondition leaves the stored record untouched.
        let mut next = record.clone();
        f(&mut next, Utc::now())?;
        *record = next.clone();
        Ok(next)
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Storage("operation log lock poisoned".to_string())
}

#[async_trait]
impl OperationLog for InMemoryOperationLog {
    async fn create(
        &self,
        kind: OperationKind,
        subject_ref: Option<String>,
        request_payload: JsonValue,
        retry_ceiling: u32,
    ) -> Result<OperationRecord, StoreError> {
        let record = OperationRecord::new(kind, subject_ref, request_payload, retry_ceiling);
        self.insert(record.clone())?;
        Ok(record)
    }

    async fn begin_attempt(&self, id: OperationId) -> Result<OperationRecord, StoreError> {
        self.mutate(id, |r, now| r.begin_attempt(now))
    }

    async fn record_success(
        &self,
        id: OperationId,
        response_payload: JsonValue,
        external_ref: Option<String>,
    ) -> Result<OperationRecord, StoreError> {
        self.mutate(id, |r, now| r.record_success(response_payload, external_ref, now))
    }

    async fn record_failure(
        &self,
        id: OperationId,
        error_detail: String,
    ) -> Result<OperationRecord, StoreError> {
        self.mutate(id, |r, now| r.record_failure(error_detail, now))
    }

    async fn record_rejection(
        &self,
        id: OperationId,
        error_detail: String,
    ) -> Result<OperationRecord, StoreError> {
        self.mutate(id, |r, now| r.record_rejection(error_detail, now))
    }

    async fn get(&self, id: OperationId) -> Result<Option<OperationRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: OperationFilter,
        pagination: Pagination,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut result: Vec<_> = records.values().filter(|r| filter.matches(r)).cloned().collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(pagination.apply(result))
    }

    async fn list_idle(
        &self,
        state: OperationState,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| r.state == state && r.updated_at <= updated_before)
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.updated_at, r.id));
        result.truncate(limit as usize);
        Ok(result)
    }

    async fn list_ready(
        &self,
        backoff: &RetryScheduler,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut ready: Vec<_> = records
            .values()
            .filter(|r| backoff.should_retry(r))
            .map(|r| (backoff.ready_at(r), r))
            .filter(|(ready_at, _)| *ready_at <= now)
            .collect();

        ready.sort_by_key(|(ready_at, r)| (*ready_at, r.id));
        Ok(ready
            .into_iter()
            .take(limit as usize)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn mark_escalated(&self, id: OperationId) -> Result<OperationRecord, StoreError> {
        self.mutate(id, |r, now| r.mark_escalated(now))
    }

    async fn list_unescalated(&self, limit: u32) -> Result<Vec<OperationRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| r.awaits_escalation())
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.updated_at, r.id));
        result.truncate(limit as usize);
        Ok(result)
    }

    async fn count_by_state(
        &self,
        created_since: Option<DateTime<Utc>>,
    ) -> Result<StateCounts, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut counts = StateCounts::default();
        for record in records.values() {
            if created_since.is_none_or(|since| record.created_at >= since) {
                counts.add(record.state, 1);
            }
        }
        Ok(counts)
    }
}
