//! Postgres-backed `DurableQueue`, grounded on the `claim_jobs` /
//! `extend_lease` pattern: a `FOR UPDATE SKIP LOCKED` CTE feeding an
//! `UPDATE ... RETURNING` claims a batch atomically and recovers jobs
//! whose lease has expired without a separate sweep.

use crate::{DurableQueue, QueuedJob, QueueError};
use async_trait::async_trait;
use auditcore::AuditEvent;
use sqlx::PgPool;
use std::time::Duration;

pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue_name: String,
    event: sqlx::types::Json<AuditEvent>,
    attempt: i32,
    enqueued_at: chrono::DateTime<chrono::Utc>,
    lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    worker_id: Option<String>,
}

impl From<JobRow> for QueuedJob {
    fn from(row: JobRow) -> Self {
        QueuedJob {
            id: row.id,
            queue_name: row.queue_name,
            event: row.event.0,
            attempt: row.attempt.max(0) as u32,
            enqueued_at: row.enqueued_at,
            lease_expires_at: row.lease_expires_at,
            worker_id: row.worker_id,
        }
    }
}

#[async_trait]
impl DurableQueue for PostgresQueue {
    async fn enqueue(&self, queue_name: &str, event: AuditEvent) -> Result<i64, QueueError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO audit_queue (queue_name, event, status, attempt, enqueued_at)
            VALUES ($1, $2, 'pending', 0, NOW())
            RETURNING id
            "#,
        )
        .bind(queue_name)
        .bind(sqlx::types::Json(event))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(row.0)
    }

    async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        let lease_ms = lease.as_millis() as i64;
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM audit_queue
                WHERE queue_name = $1
                  AND (
                      status = 'pending'
                      OR (status = 'running' AND lease_expires_at < NOW())
                  )
                ORDER BY enqueued_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE audit_queue
            SET status = 'running',
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING id, queue_name, event, attempt, enqueued_at, lease_expires_at, worker_id
            "#,
        )
        .bind(queue_name)
        .bind(limit as i64)
        .bind(lease_ms.to_string())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn extend_lease(&self, job_id: i64, lease: Duration) -> Result<(), QueueError> {
        let lease_ms = lease.as_millis() as i64;
        let result = sqlx::query(
            r#"
            UPDATE audit_queue
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(lease_ms.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn ack(&self, job_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM audit_queue WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, job_id: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE audit_queue
            SET status = 'pending', attempt = attempt + 1, lease_expires_at = NULL, worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn depth(&self, queue_name: &str) -> Result<i64, QueueError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM audit_queue WHERE queue_name = $1 AND status IN ('pending', 'running')",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(row.0)
    }
}
