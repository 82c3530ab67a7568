//! Postgres-backed operation log.
//!
//! Every transition is a single conditional `UPDATE ... WHERE state IN (...)
//! RETURNING`, so the database row is the serialization point: two workers
//! racing on `begin_attempt` cannot both match the `WHERE` clause.
//!
//! ## Error Mapping
//!
//! | Outcome | StoreError |
//! |---------|------------|
//! | `UPDATE` matched no row, record missing | `NotFound` |
//! | `UPDATE` matched no row, record `in_flight` | `ConcurrentAttempt` |
//! | `UPDATE` matched no row, other state | `PreconditionFailed` |
//! | unique violation (`23505`) on insert | `AlreadyExists` |
//! | any other SQLx error | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use marketsync_core::OperationId;

use crate::error::StoreError;
use crate::operation::{OperationFilter, OperationKind, OperationRecord, OperationState, Pagination};
use crate::retry::RetryScheduler;
use crate::stats::StateCounts;

use super::OperationLog;

const COLUMNS: &str = "id, kind, subject_ref, external_ref, state, request_payload, \
    response_payload, error_detail, attempt_count, retry_ceiling, created_at, updated_at, completed_at, \
    escalated_at";

/// Upper bound on a backoff delay evaluated in SQL. Keeps `make_interval`
/// in range for large attempt counts; far beyond any real deployment.
const BACKOFF_HORIZON_SECS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

/// Postgres-backed operation log (`sync_operations` table).
#[derive(Debug, Clone)]
pub struct PostgresOperationLog {
    pool: Arc<PgPool>,
}

impl PostgresOperationLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_operations (
                id               UUID PRIMARY KEY,
                kind             TEXT NOT NULL,
                subject_ref      TEXT NULL,
                external_ref     TEXT NULL,
                state            TEXT NOT NULL,
                request_payload  JSONB NOT NULL,
                response_payload JSONB NULL,
                error_detail     TEXT NULL,
                attempt_count    INTEGER NOT NULL CHECK (attempt_count >= 0),
                retry_ceiling    INTEGER NOT NULL CHECK (retry_ceiling >= 1),
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL,
                completed_at     TIMESTAMPTZ NULL,
                escalated_at     TIMESTAMPTZ NULL,
                CHECK (attempt_count <= retry_ceiling)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;

        for ddl in [
            "ALTER TABLE sync_operations ADD COLUMN IF NOT EXISTS escalated_at TIMESTAMPTZ NULL",
            "CREATE INDEX IF NOT EXISTS sync_operations_state_updated ON sync_operations (state, updated_at)",
            "CREATE INDEX IF NOT EXISTS sync_operations_unescalated ON sync_operations (updated_at) \
             WHERE state = 'failed_exhausted' AND escalated_at IS NULL",
            "CREATE INDEX IF NOT EXISTS sync_operations_created ON sync_operations (created_at DESC)",
        ] {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn fetch(&self, id: OperationId) -> Result<Option<OperationRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sync_operations WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| row_to_record(&r)).transpose()
    }

    /// Turn "the conditional update matched nothing" into the precise error.
    async fn explain_miss(
        &self,
        id: OperationId,
        action: &'static str,
    ) -> StoreError {
        match self.fetch(id).await {
            Ok(None) => StoreError::NotFound(id),
            Ok(Some(record)) => {
                let check = match action {
                    "begin_attempt" => record.check_can_begin(),
                    "mark_escalated" => record.check_exhausted(action),
                    _ => record.check_in_flight(action),
                };
                // The row changed between the UPDATE and this read; report the
                // conflict rather than pretending the write happened.
                check.err().unwrap_or(StoreError::ConcurrentAttempt(id))
            }
            Err(e) => e,
        }
    }
}

#[async_trait]
impl OperationLog for PostgresOperationLog {
    #[instrument(skip(self, request_payload), fields(kind = %kind), err)]
    async fn create(
        &self,
        kind: OperationKind,
        subject_ref: Option<String>,
        request_payload: JsonValue,
        retry_ceiling: u32,
    ) -> Result<OperationRecord, StoreError> {
        let record = OperationRecord::new(kind, subject_ref, request_payload, retry_ceiling);

        sqlx::query(
            r#"
            INSERT INTO sync_operations (
                id, kind, subject_ref, external_ref, state, request_payload,
                response_payload, error_detail, attempt_count, retry_ceiling,
                created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, NULL, $4, $5, NULL, NULL, 0, $6, $7, $7, NULL)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.kind.as_str())
        .bind(record.subject_ref.as_deref())
        .bind(record.state.as_str())
        .bind(&record.request_payload)
        .bind(record.retry_ceiling as i32)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        Ok(record)
    }

    #[instrument(skip(self), fields(operation_id = %id), err)]
    async fn begin_attempt(&self, id: OperationId) -> Result<OperationRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_operations
            SET state = 'in_flight',
                attempt_count = attempt_count + 1,
                updated_at = $2
            WHERE id = $1
              AND state IN ('pending', 'failed_retrying')
              AND attempt_count < retry_ceiling
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("begin_attempt", e))?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(self.explain_miss(id, "begin_attempt").await),
        }
    }

    #[instrument(skip(self, response_payload), fields(operation_id = %id), err)]
    async fn record_success(
        &self,
        id: OperationId,
        response_payload: JsonValue,
        external_ref: Option<String>,
    ) -> Result<OperationRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_operations
            SET state = 'succeeded',
                response_payload = $2,
                external_ref = COALESCE($3, external_ref),
                error_detail = NULL,
                updated_at = $4,
                completed_at = $4
            WHERE id = $1 AND state = 'in_flight'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(&response_payload)
        .bind(external_ref.as_deref())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_success", e))?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(self.explain_miss(id, "record_success").await),
        }
    }

    #[instrument(skip(self), fields(operation_id = %id), err)]
    async fn record_failure(
        &self,
        id: OperationId,
        error_detail: String,
    ) -> Result<OperationRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_operations
            SET state = CASE WHEN attempt_count < retry_ceiling
                             THEN 'failed_retrying' ELSE 'failed_exhausted' END,
                completed_at = CASE WHEN attempt_count < retry_ceiling
                                    THEN NULL ELSE $3 END,
                error_detail = $2,
                updated_at = $3
            WHERE id = $1 AND state = 'in_flight'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(&error_detail)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(self.explain_miss(id, "record_failure").await),
        }
    }

    #[instrument(skip(self), fields(operation_id = %id), err)]
    async fn record_rejection(
        &self,
        id: OperationId,
        error_detail: String,
    ) -> Result<OperationRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_operations
            SET state = 'failed_exhausted',
                error_detail = $2,
                updated_at = $3,
                completed_at = $3
            WHERE id = $1 AND state = 'in_flight'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(&error_detail)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_rejection", e))?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(self.explain_miss(id, "record_rejection").await),
        }
    }

    async fn get(&self, id: OperationId) -> Result<Option<OperationRecord>, StoreError> {
        self.fetch(id).await
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: OperationFilter,
        pagination: Pagination,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sync_operations
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR kind = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self), fields(state = %state), err)]
    async fn list_idle(
        &self,
        state: OperationState,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sync_operations
            WHERE state = $1 AND updated_at <= $2
            ORDER BY updated_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(state.as_str())
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_idle", e))?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self, backoff), err)]
    async fn list_ready(
        &self,
        backoff: &RetryScheduler,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let cap_secs = backoff
            .max_delay
            .map_or(BACKOFF_HORIZON_SECS, |d| d.as_secs_f64().min(BACKOFF_HORIZON_SECS));

        // ready_at mirrors RetryScheduler::ready_at: updated_at + base * 2^attempts.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM (
                SELECT *,
                       updated_at + make_interval(secs => LEAST(
                           $1::float8 * power(2::float8, LEAST(attempt_count, 62)),
                           $2::float8
                       )) AS ready_at
                FROM sync_operations
                WHERE state = 'failed_retrying' AND attempt_count < retry_ceiling
            ) candidates
            WHERE ready_at <= $3
            ORDER BY ready_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(backoff.base_delay.as_secs_f64())
        .bind(cap_secs)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_ready", e))?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self), fields(operation_id = %id), err)]
    async fn mark_escalated(&self, id: OperationId) -> Result<OperationRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_operations
            SET escalated_at = COALESCE(escalated_at, $2)
            WHERE id = $1 AND state = 'failed_exhausted'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_escalated", e))?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(self.explain_miss(id, "mark_escalated").await),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_unescalated(&self, limit: u32) -> Result<Vec<OperationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sync_operations
            WHERE state = 'failed_exhausted' AND escalated_at IS NULL
            ORDER BY updated_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_unescalated", e))?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self), err)]
    async fn count_by_state(
        &self,
        created_since: Option<DateTime<Utc>>,
    ) -> Result<StateCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n
            FROM sync_operations
            WHERE ($1::timestamptz IS NULL OR created_at >= $1)
            GROUP BY state
            "#,
        )
        .bind(created_since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_state", e))?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("count_by_state", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count_by_state", e))?;
            let state = state
                .parse::<OperationState>()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            counts.add(state, n.max(0) as u64);
        }
        Ok(counts)
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<OperationRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("failed to decode operation row: {e}"));

    let kind: String = row.try_get("kind").map_err(decode)?;
    let state: String = row.try_get("state").map_err(decode)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(decode)?;
    let retry_ceiling: i32 = row.try_get("retry_ceiling").map_err(decode)?;

    Ok(OperationRecord {
        id: OperationId::from_uuid(row.try_get("id").map_err(decode)?),
        kind: kind
            .parse::<OperationKind>()
            .map_err(|e| StoreError::Storage(e.to_string()))?,
        subject_ref: row.try_get("subject_ref").map_err(decode)?,
        external_ref: row.try_get("external_ref").map_err(decode)?,
        state: state
            .parse::<OperationState>()
            .map_err(|e| StoreError::Storage(e.to_string()))?,
        request_payload: row.try_get("request_payload").map_err(decode)?,
        response_payload: row.try_get("response_payload").map_err(decode)?,
        error_detail: row.try_get("error_detail").map_err(decode)?,
        attempt_count: attempt_count.max(0) as u32,
        retry_ceiling: retry_ceiling.max(0) as u32,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        escalated_at: row.try_get("escalated_at").map_err(decode)?,
    })
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|c| c.as_ref() == "23505"),
        _ => false,
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// These run only when `DATABASE_URL` points at a disposable database.
    async fn log() -> Option<PostgresOperationLog> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        let log = PostgresOperationLog::new(pool);
        log.migrate().await.ok()?;
        Some(log)
    }

    #[tokio::test]
    async fn conditional_transitions_against_postgres() {
        let Some(log) = log().await else {
            return;
        };

        let r = log
            .create(
                OperationKind::UpdateInventory,
                Some("product-1".into()),
                serde_json::json!({"kind": "update_inventory", "sku": "SKU-1", "quantity": 4}),
                2,
            )
            .await
            .unwrap();

        let begun = log.begin_attempt(r.id).await.unwrap();
        assert_eq!(begun.state, OperationState::InFlight);
        assert_eq!(begun.attempt_count, 1);
        assert_eq!(
            log.begin_attempt(r.id).await.unwrap_err(),
            StoreError::ConcurrentAttempt(r.id)
        );

        let failed = log.record_failure(r.id, "503".into()).await.unwrap();
        assert_eq!(failed.state, OperationState::FailedRetrying);
        assert!(failed.completed_at.is_none());

        log.begin_attempt(r.id).await.unwrap();
        let exhausted = log.record_failure(r.id, "503 again".into()).await.unwrap();
        assert_eq!(exhausted.state, OperationState::FailedExhausted);
        assert_eq!(exhausted.attempt_count, 2);
        assert!(exhausted.completed_at.is_some());

        assert!(matches!(
            log.begin_attempt(r.id).await.unwrap_err(),
            StoreError::PreconditionFailed { .. }
        ));
        assert_eq!(log.get(r.id).await.unwrap().unwrap(), exhausted);

        assert!(log.list_unescalated(1000).await.unwrap().iter().any(|o| o.id == r.id));
        let marked = log.mark_escalated(r.id).await.unwrap();
        assert!(marked.escalated_at.is_some());
        assert!(!log.list_unescalated(1000).await.unwrap().iter().any(|o| o.id == r.id));
    }

    #[tokio::test]
    async fn list_ready_orders_by_elapsed_backoff() {
        let Some(log) = log().await else {
            return;
        };

        let r = log
            .create(OperationKind::FetchOrders, None, serde_json::json!({"kind": "fetch_orders"}), 3)
            .await
            .unwrap();
        log.begin_attempt(r.id).await.unwrap();
        log.record_failure(r.id, "503".into()).await.unwrap();

        let slow = RetryScheduler::new(std::time::Duration::from_secs(3600));
        let ready = log.list_ready(&slow, Utc::now(), 1000).await.unwrap();
        assert!(!ready.iter().any(|o| o.id == r.id));

        let later = Utc::now() + chrono::Duration::hours(3);
        let ready = log.list_ready(&slow, later, 1000).await.unwrap();
        assert!(ready.iter().any(|o| o.id == r.id));
    }

    #[tokio::test]
    async fn success_keeps_payload_and_external_ref() {
        let Some(log) = log().await else {
            return;
        };

        let r = log
            .create(OperationKind::FetchOrders, None, serde_json::json!({"kind": "fetch_orders"}), 3)
            .await
            .unwrap();
        log.begin_attempt(r.id).await.unwrap();
        let done = log
            .record_success(r.id, serde_json::json!({"count": 1}), Some("FEED_1".into()))
            .await
            .unwrap();

        assert_eq!(done.state, OperationState::Succeeded);
        assert_eq!(done.external_ref.as_deref(), Some("FEED_1"));
        assert_eq!(done.response_payload, Some(serde_json::json!({"count": 1})));
        assert_eq!(done.request_payload, r.request_payload);

        let missing = OperationId::new();
        assert_eq!(
            log.record_success(missing, serde_json::json!({}), None).await.unwrap_err(),
            StoreError::NotFound(missing)
        );
    }
}
