//! In-memory dead-letter store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use marketsync_core::{DeadLetterId, OperationId};

use crate::error::StoreError;
use crate::operation::{OperationRecord, Pagination};

use super::{DeadLetterEntry, DeadLetterStore};

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<DeadLetterId, DeadLetterEntry>,
    by_operation: HashMap<OperationId, DeadLetterId>,
    /// Entries an operator resolved, by originating record.
    resolved: HashMap<OperationId, DeadLetterEntry>,
}

/// Dead-letter store backed by maps keyed by entry id and by operation id.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    inner: RwLock<Inner>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Storage("dead-letter store lock poisoned".to_string())
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn quarantine(&self, record: &OperationRecord) -> Result<DeadLetterEntry, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        if let Some(existing) = inner
            .by_operation
            .get(&record.id)
            .and_then(|id| inner.entries.get(id))
        {
            return Ok(existing.clone());
        }
        if let Some(resolved) = inner.resolved.get(&record.id) {
            return Ok(resolved.clone());
        }

        let entry = DeadLetterEntry::from_record(record)?;
        inner.by_operation.insert(entry.operation_id, entry.id);
        inner.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn list(&self, pagination: Pagination) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut result: Vec<_> = inner.entries.values().cloned().collect();

        result.sort_by(|a, b| {
            b.quarantined_at
                .cmp(&a.quarantined_at)
                .then(b.id.cmp(&a.id))
        });
        Ok(pagination.apply(result))
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.entries.get(&id).cloned())
    }

    async fn find_by_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .by_operation
            .get(&operation_id)
            .and_then(|id| inner.entries.get(id))
            .cloned())
    }

    async fn remove(&self, id: DeadLetterId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        match inner.entries.remove(&id) {
            Some(entry) => {
                inner.by_operation.remove(&entry.operation_id);
                inner.resolved.insert(entry.operation_id, entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::operation::{OperationKind, OperationState};

    fn exhausted(detail: &str) -> OperationRecord {
        let mut r = OperationRecord::new(
            OperationKind::CreateListing,
            Some("product-42".into()),
            serde_json::json!({"kind": "create_listing", "title": "Lamp"}),
            1,
        );
        r.begin_attempt(Utc::now()).unwrap();
        r.record_failure(detail, Utc::now()).unwrap();
        assert_eq!(r.state, OperationState::FailedExhausted);
        r
    }

    #[tokio::test]
    async fn quarantine_snapshots_the_record() {
        let store = InMemoryDeadLetterStore::new();
        let record = exhausted("gateway unreachable");

        let entry = store.quarantine(&record).await.unwrap();
        assert_eq!(entry.operation_id, record.id);
        assert_eq!(entry.kind, OperationKind::CreateListing);
        assert_eq!(entry.error_detail, "gateway unreachable");
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.request_payload, record.request_payload);
    }

    #[tokio::test]
    async fn quarantine_is_idempotent_per_record() {
        let store = InMemoryDeadLetterStore::new();
        let record = exhausted("boom");

        let first = store.quarantine(&record).await.unwrap();
        let second = store.quarantine(&record).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(
            store.find_by_operation(record.id).await.unwrap().map(|e| e.id),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn quarantine_requires_exhausted_record() {
        let store = InMemoryDeadLetterStore::new();
        let pending = OperationRecord::new(OperationKind::FetchOrders, None, serde_json::json!({}), 3);

        let err = store.quarantine(&pending).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_is_most_recent_first() {
        let store = InMemoryDeadLetterStore::new();
        let older = store.quarantine(&exhausted("first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let newer = store.quarantine(&exhausted("second")).await.unwrap();

        let entries = store.list(Pagination::default()).await.unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        let page = store.list(Pagination::new(Some(1), Some(1))).await.unwrap();
        assert_eq!(page[0].id, older.id);
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_was_removed() {
        let store = InMemoryDeadLetterStore::new();
        let entry = store.quarantine(&exhausted("boom")).await.unwrap();

        assert!(!store.remove(DeadLetterId::new()).await.unwrap());
        assert!(store.remove(entry.id).await.unwrap());
        assert!(!store.remove(entry.id).await.unwrap());
        assert!(store.get(entry.id).await.unwrap().is_none());
        assert!(store.find_by_operation(entry.operation_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolved_entries_are_not_reopened() {
        let store = InMemoryDeadLetterStore::new();
        let record = exhausted("boom");
        let entry = store.quarantine(&record).await.unwrap();
        assert!(store.remove(entry.id).await.unwrap());

        let again = store.quarantine(&record).await.unwrap();
        assert_eq!(again.id, entry.id);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.list(Pagination::default()).await.unwrap().is_empty());
        assert!(!store.remove(entry.id).await.unwrap());
    }
}
