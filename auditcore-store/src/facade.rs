//! Audit Store Facade (spec §4.I): the single write/read surface the
//! processor talks to. Hashing is delegated to `integrity`, partition
//! routing to the database's declared partitioning.

use crate::integrity::{self, VerificationOutcome};
use crate::partition::{PartitionError, PartitionManager};
use auditcore::{AuditEvent, IntegrityVerification};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("no partition covers timestamp {0}")]
    NoPartitionForTimestamp(DateTime<Utc>),
    #[error(transparent)]
    Partition(#[from] PartitionError),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct AuditStoreFacade {
    pool: PgPool,
    partitions: PartitionManager,
}

impl AuditStoreFacade {
    pub fn new(pool: PgPool) -> Self {
        let partitions = PartitionManager::new(pool.clone());
        Self { pool, partitions }
    }

    /// Insert `event`, enriching it with its integrity hash first. If no
    /// partition covers `event.timestamp`, create the missing month ahead
    /// of the insert rather than rejecting it outright.
    pub async fn insert(&self, event: AuditEvent) -> Result<i64, StoreError> {
        let event = integrity::enrich(event);

        if !self.partition_covers(event.timestamp).await? {
            self.partitions.create_partition_for(event.timestamp).await?;
        }

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO audit_log
                ("timestamp", tenant_id, principal_id, action, target_type, target_id, status,
                 hash, hash_algorithm, event_version, correlation_id, data_classification,
                 retention_policy, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(event.timestamp)
        .bind(&event.tenant_id)
        .bind(&event.principal_id)
        .bind(&event.action)
        .bind(&event.target_type)
        .bind(&event.target_id)
        .bind(serde_json::to_string(&event.status).unwrap_or_default())
        .bind(&event.hash)
        .bind(&event.hash_algorithm)
        .bind(&event.event_version)
        .bind(&event.correlation_id)
        .bind(serde_json::to_string(&event.data_classification).unwrap_or_default())
        .bind(&event.retention_policy)
        .bind(sqlx::types::Json(&event.details))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn partition_covers(&self, timestamp: DateTime<Utc>) -> Result<bool, StoreError> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_tables
                WHERE tablename = 'audit_log_' || to_char($1, 'YYYY_MM')
            )
            "#,
        )
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists.0)
    }

    /// Verify a stored event's integrity and append the verification
    /// record. Append-only: never updates a prior verification.
    pub async fn verify_and_record(
        &self,
        event_ref: i64,
        event: &AuditEvent,
        verifier_id: &str,
    ) -> Result<VerificationOutcome, StoreError> {
        let record = integrity::verify_record(event_ref, event, verifier_id);
        let outcome = VerificationOutcome {
            status: record.status,
            computed_hash: record.computed_hash.clone(),
            expected_hash: record.expected_hash.clone(),
        };
        self.write_integrity_record(&record).await?;
        Ok(outcome)
    }

    pub async fn write_integrity_record(&self, record: &IntegrityVerification) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO audit_integrity_log
                (audit_log_id, verification_timestamp, status, computed_hash, expected_hash, verifier_id, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(record.event_ref)
        .bind(record.verified_at)
        .bind(serde_json::to_string(&record.status).unwrap_or_default())
        .bind(&record.computed_hash)
        .bind(&record.expected_hash)
        .bind(&record.verifier_id)
        .bind(sqlx::types::Json(serde_json::json!({})))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Read path: events for a tenant within `[from, to)`, newest first.
    /// Not core to the pipeline, but the schema's indexes are designed to
    /// make this cheap (spec §4.F).
    pub async fn find_by_tenant_and_range(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AuditEventRow>, StoreError> {
        let rows = sqlx::query_as::<_, AuditEventRow>(
            r#"
            SELECT id, "timestamp", tenant_id, principal_id, action, target_type, target_id,
                   status, hash, hash_algorithm, event_version, correlation_id,
                   data_classification, retention_policy, details
            FROM audit_log
            WHERE tenant_id = $1 AND "timestamp" >= $2 AND "timestamp" < $3
            ORDER BY "timestamp" DESC
            LIMIT $4
            "#,
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEventRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub principal_id: Option<String>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub status: String,
    pub hash: Option<String>,
    pub hash_algorithm: Option<String>,
    pub event_version: String,
    pub correlation_id: Option<String>,
    pub data_classification: String,
    pub retention_policy: String,
    pub details: sqlx::types::Json<serde_json::Value>,
}
