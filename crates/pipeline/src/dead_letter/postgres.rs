//! Postgres-backed dead-letter store (`sync_dead_letters` table).
//!
//! `operation_id` is unique, so quarantine is an `INSERT ... ON CONFLICT DO
//! NOTHING` followed by a read of whichever row won. Resolution sets
//! `resolved_at`; resolved rows are invisible to reads but still hold the
//! unique key.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use marketsync_core::{DeadLetterId, OperationId};

use crate::error::StoreError;
use crate::log::postgres::map_sqlx_error;
use crate::operation::{OperationKind, OperationRecord, Pagination};

use super::{DeadLetterEntry, DeadLetterStore};

const COLUMNS: &str =
    "id, operation_id, kind, error_detail, request_payload, attempt_count, quarantined_at";

#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS sync_dead_letters (
                id              UUID PRIMARY KEY,
                operation_id    UUID NOT NULL UNIQUE,
                kind            TEXT NOT NULL,
                error_detail    TEXT NOT NULL,
                request_payload JSONB NOT NULL,
                attempt_count   INTEGER NOT NULL,
                quarantined_at  TIMESTAMPTZ NOT NULL,
                resolved_at     TIMESTAMPTZ NULL
            )
            "#,
            "ALTER TABLE sync_dead_letters ADD COLUMN IF NOT EXISTS resolved_at TIMESTAMPTZ NULL",
            "CREATE INDEX IF NOT EXISTS sync_dead_letters_open ON sync_dead_letters (quarantined_at DESC) \
             WHERE resolved_at IS NULL",
        ] {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    #[instrument(skip(self, record), fields(operation_id = %record.id), err)]
    async fn quarantine(&self, record: &OperationRecord) -> Result<DeadLetterEntry, StoreError> {
        let entry = DeadLetterEntry::from_record(record)?;

        sqlx::query(
            r#"
            INSERT INTO sync_dead_letters (
                id, operation_id, kind, error_detail, request_payload, attempt_count, quarantined_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (operation_id) DO NOTHING
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.operation_id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(&entry.error_detail)
        .bind(&entry.request_payload)
        .bind(entry.attempt_count as i32)
        .bind(entry.quarantined_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("quarantine", e))?;

        // Resolved rows count: they still own this record's escalation.
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sync_dead_letters WHERE operation_id = $1"
        ))
        .bind(record.id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("quarantine", e))?;

        row.map(|r| row_to_entry(&r))
            .transpose()?
            .ok_or_else(|| StoreError::Storage(format!("dead letter for {} vanished after insert", record.id)))
    }

    #[instrument(skip(self), err)]
    async fn list(&self, pagination: Pagination) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sync_dead_letters
            WHERE resolved_at IS NULL
            ORDER BY quarantined_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sync_dead_letters WHERE id = $1 AND resolved_at IS NULL"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.map(|r| row_to_entry(&r)).transpose()
    }

    async fn find_by_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sync_dead_letters WHERE operation_id = $1 AND resolved_at IS NULL"
        ))
        .bind(operation_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_dead_letter", e))?;

        row.map(|r| row_to_entry(&r)).transpose()
    }

    #[instrument(skip(self), fields(dead_letter_id = %id), err)]
    async fn remove(&self, id: DeadLetterId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_dead_letters SET resolved_at = $2 WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id.as_uuid())
        .bind(chrono::Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_dead_letter", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_dead_letters WHERE resolved_at IS NULL")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_dead_letters", e))?;
        Ok(n.max(0) as u64)
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("failed to decode dead letter row: {e}"));

    let kind: String = row.try_get("kind").map_err(decode)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(decode)?;

    Ok(DeadLetterEntry {
        id: DeadLetterId::from_uuid(row.try_get("id").map_err(decode)?),
        operation_id: OperationId::from_uuid(row.try_get("operation_id").map_err(decode)?),
        kind: kind
            .parse::<OperationKind>()
            .map_err(|e| StoreError::Storage(e.to_string()))?,
        error_detail: row.try_get("error_detail").map_err(decode)?,
        request_payload: row.try_get("request_payload").map_err(decode)?,
        attempt_count: attempt_count.max(0) as u32,
        quarantined_at: row.try_get("quarantined_at").map_err(decode)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn store() -> Option<PostgresDeadLetterStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        let store = PostgresDeadLetterStore::new(pool);
        store.migrate().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn quarantine_is_idempotent_against_postgres() {
        let Some(store) = store().await else {
            return;
        };

        let mut record = OperationRecord::new(
            OperationKind::UpdateInventory,
            Some("product-9".into()),
            serde_json::json!({"kind": "update_inventory", "sku": "SKU-9", "quantity": 1}),
            1,
        );
        record.begin_attempt(Utc::now()).unwrap();
        record.record_failure("throttled", Utc::now()).unwrap();

        let first = store.quarantine(&record).await.unwrap();
        let second = store.quarantine(&record).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.error_detail, "throttled");

        assert!(store.remove(first.id).await.unwrap());
        assert!(!store.remove(first.id).await.unwrap());
        assert!(store.find_by_operation(record.id).await.unwrap().is_none());

        let again = store.quarantine(&record).await.unwrap();
        assert_eq!(again.id, first.id);
        assert!(store.get(first.id).await.unwrap().is_none());
    }
}
