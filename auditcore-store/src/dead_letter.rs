//! Dead-letter persistence (spec §4.C, storage half). Grounded on
//! `DeadLetterProcessor`/`DeadLetterQueue`'s retry-candidate and metrics
//! queries, adapted to the `dead_letter_events` schema of spec §6.1. The
//! operator-facing alert-cooldown logic lives in `auditcore-processor`;
//! this module only owns durable storage.

use auditcore::{AuditEvent, DeadLetterRecord, RetryHistoryEntry};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeadLetterStoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("dead-letter record {0} not found")]
    NotFound(i64),
}

impl From<sqlx::Error> for DeadLetterStoreError {
    fn from(e: sqlx::Error) -> Self {
        DeadLetterStoreError::Database(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterMetrics {
    pub total_events: i64,
    pub events_today: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub top_failure_reasons: Vec<(String, i64)>,
}

pub struct DeadLetterStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: i64,
    original_event: sqlx::types::Json<AuditEvent>,
    failure_reason: String,
    failure_count: i32,
    first_failure_at: DateTime<Utc>,
    last_failure_at: DateTime<Utc>,
    original_job_id: String,
    original_queue_name: String,
    error_stack: Option<String>,
    retry_history: sqlx::types::Json<Vec<RetryHistoryEntry>>,
}

impl From<DeadLetterRow> for DeadLetterRecord {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetterRecord {
            id: Some(row.id),
            original_event: row.original_event.0,
            failure_reason: row.failure_reason,
            failure_count: row.failure_count.max(0) as u32,
            first_failure_at: row.first_failure_at,
            last_failure_at: row.last_failure_at,
            original_job_id: row.original_job_id,
            original_queue_name: row.original_queue_name,
            error_stack: row.error_stack,
            retry_history: row.retry_history.0,
        }
    }
}

impl DeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or, if `original_job_id` already has a record (the job was
    /// retried and failed again before `reprocess`), update it in place.
    /// Serializing on the unique constraint avoids duplicate rows for the
    /// same job (spec §5 concurrency model).
    pub async fn enqueue_failed(&self, record: &DeadLetterRecord) -> Result<i64, DeadLetterStoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO dead_letter_events
                (original_event, failure_reason, failure_count, first_failure_at, last_failure_at,
                 original_job_id, original_queue_name, error_stack, retry_history)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (original_job_id) DO UPDATE SET
                failure_reason = EXCLUDED.failure_reason,
                failure_count = EXCLUDED.failure_count,
                last_failure_at = EXCLUDED.last_failure_at,
                error_stack = EXCLUDED.error_stack,
                retry_history = EXCLUDED.retry_history
            RETURNING id
            "#,
        )
        .bind(sqlx::types::Json(&record.original_event))
        .bind(&record.failure_reason)
        .bind(record.failure_count as i32)
        .bind(record.first_failure_at)
        .bind(record.last_failure_at)
        .bind(&record.original_job_id)
        .bind(&record.original_queue_name)
        .bind(&record.error_stack)
        .bind(sqlx::types::Json(&record.retry_history))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get(&self, id: i64) -> Result<DeadLetterRecord, DeadLetterStoreError> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"SELECT id, original_event, failure_reason, failure_count, first_failure_at,
               last_failure_at, original_job_id, original_queue_name, error_stack, retry_history
               FROM dead_letter_events WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DeadLetterStoreError::NotFound(id))?;
        Ok(row.into())
    }

    /// Operator reprocess: delete the record so `depth()` and `metrics()`
    /// no longer count it. Idempotent: a second call on an already-removed
    /// id is not an error from the caller's perspective.
    pub async fn remove(&self, id: i64) -> Result<(), DeadLetterStoreError> {
        sqlx::query("DELETE FROM dead_letter_events WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn depth(&self) -> Result<i64, DeadLetterStoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letter_events").fetch_one(&self.pool).await?;
        Ok(row.0)
    }

    pub async fn metrics(&self) -> Result<DeadLetterMetrics, DeadLetterStoreError> {
        let totals: (i64, i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE first_failure_at >= date_trunc('day', NOW())),
                MIN(first_failure_at),
                MAX(last_failure_at)
            FROM dead_letter_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let reasons: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT failure_reason, COUNT(*) AS n
            FROM dead_letter_events
            GROUP BY failure_reason
            ORDER BY n DESC
            LIMIT 10
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(DeadLetterMetrics {
            total_events: totals.0,
            events_today: totals.1,
            oldest: totals.2,
            newest: totals.3,
            top_failure_reasons: reasons,
        })
    }

    /// Remove records older than `max_retention_days`. Returns the count
    /// removed.
    pub async fn enforce_retention(&self, max_retention_days: i64) -> Result<i64, DeadLetterStoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(max_retention_days);
        let result = sqlx::query("DELETE FROM dead_letter_events WHERE first_failure_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as i64)
    }
}
