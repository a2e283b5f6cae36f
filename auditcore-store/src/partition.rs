//! Partition Manager (spec §4.F): monthly range partitions of `audit_log`
//! keyed on `timestamp`. The identifier-quoting discipline is grounded on
//! `RetentionEnforcer::quote_ident`'s fail-closed contract: partition names
//! are built from calendar arithmetic, never from caller-supplied strings,
//! but are still quoted before they reach a `CREATE TABLE` statement.

use auditcore::PartitionDescriptor;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("database error: {0}")]
    Database(String),
    #[error("illegal identifier: {0}")]
    IllegalIdentifier(String),
}

impl From<sqlx::Error> for PartitionError {
    fn from(e: sqlx::Error) -> Self {
        PartitionError::Database(e.to_string())
    }
}

/// Quote a Postgres identifier, rejecting anything that isn't
/// `[A-Za-z_][A-Za-z0-9_]*`. Every identifier this module builds is derived
/// from calendar math, so this never legitimately rejects a caller, but it
/// is the last line of defense against a malformed table name reaching SQL.
fn quote_ident(ident: &str) -> Result<String, PartitionError> {
    let mut chars = ident.chars();
    let first = chars.next().ok_or_else(|| PartitionError::IllegalIdentifier(ident.to_string()))?;
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return Err(PartitionError::IllegalIdentifier(ident.to_string()));
    }
    if !chars.all(|c| c == '_' || c.is_ascii_alphanumeric()) {
        return Err(PartitionError::IllegalIdentifier(ident.to_string()));
    }
    Ok(format!("\"{ident}\""))
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().expect("valid calendar month")
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn partition_name(year: i32, month: u32) -> String {
    format!("audit_log_{year:04}_{month:02}")
}

#[derive(Debug, Clone)]
pub struct AnalyzeReport {
    pub total_partitions: i64,
    pub total_size_bytes: i64,
    pub total_records: i64,
    pub average_size_bytes: f64,
    pub recommendations: Vec<String>,
}

pub struct PartitionManager {
    pool: PgPool,
}

impl PartitionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensure the declaratively-partitioned parent table exists.
    pub async fn initialize_parent(&self) -> Result<(), PartitionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id BIGSERIAL,
                "timestamp" TIMESTAMPTZ NOT NULL,
                tenant_id TEXT NOT NULL,
                principal_id TEXT,
                action TEXT NOT NULL,
                target_type TEXT,
                target_id TEXT,
                status TEXT NOT NULL,
                hash TEXT,
                hash_algorithm TEXT,
                event_version TEXT NOT NULL,
                correlation_id TEXT,
                data_classification TEXT NOT NULL,
                retention_policy TEXT NOT NULL,
                processing_latency_ms INTEGER,
                archived_at TIMESTAMPTZ,
                details JSONB NOT NULL DEFAULT '{}',
                PRIMARY KEY (id, "timestamp")
            ) PARTITION BY RANGE ("timestamp")
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create partitions for the current month plus the next `n` months,
    /// iterating by calendar-month arithmetic rather than a fixed delta
    /// (spec §4.F ordering rule). Idempotent: existing partitions are
    /// skipped. A single partition's creation failure is fatal; an index
    /// failure on that partition is logged and does not abort the batch.
    pub async fn create_partitions_ahead(&self, n: u32) -> Result<Vec<String>, PartitionError> {
        let now = Utc::now();
        let mut year = now.year();
        let mut month = now.month();
        let mut created = Vec::new();

        for _ in 0..=n {
            let name = partition_name(year, month);
            let range_start = month_start(year, month);
            let (next_year, next_month_num) = next_month(year, month);
            let range_end = month_start(next_year, next_month_num);

            if self.create_partition(&name, range_start, range_end).await? {
                created.push(name.clone());
                if let Err(e) = self.create_partition_indexes(&name).await {
                    tracing::warn!(partition = %name, error = %e, "index creation failed on partition");
                }
            }

            year = next_year;
            month = next_month_num;
        }

        Ok(created)
    }

    /// Create (if missing) the single partition that covers `timestamp`'s
    /// calendar month. Used on an insert-time miss, where the partition
    /// that must exist is the one the event actually falls in, not
    /// whatever the wall-clock month happens to be (spec §4.I).
    pub async fn create_partition_for(&self, timestamp: DateTime<Utc>) -> Result<String, PartitionError> {
        let year = timestamp.year();
        let month = timestamp.month();
        let name = partition_name(year, month);
        let range_start = month_start(year, month);
        let (next_year, next_month_num) = next_month(year, month);
        let range_end = month_start(next_year, next_month_num);

        if self.create_partition(&name, range_start, range_end).await? {
            if let Err(e) = self.create_partition_indexes(&name).await {
                tracing::warn!(partition = %name, error = %e, "index creation failed on partition");
            }
        }

        Ok(name)
    }

    /// Returns `true` if the partition was newly created.
    async fn create_partition(
        &self,
        name: &str,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<bool, PartitionError> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_tables WHERE tablename = $1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        if exists.0 {
            return Ok(false);
        }

        let name_q = quote_ident(name)?;
        let sql = format!(
            r#"CREATE TABLE {name_q} PARTITION OF audit_log FOR VALUES FROM ($1) TO ($2)"#
        );
        sqlx::query(&sql).bind(range_start).bind(range_end).execute(&self.pool).await?;
        Ok(true)
    }

    pub async fn create_partition_indexes(&self, name: &str) -> Result<(), PartitionError> {
        let name_q = quote_ident(name)?;
        let single_column = [
            "id", "timestamp", "principal_id", "tenant_id", "action", "status",
            "data_classification", "retention_policy", "correlation_id",
        ];
        for column in single_column {
            let column_q = quote_ident(column)?;
            let index_name = quote_ident(&format!("{name}_{column}_idx"))?;
            let sql =
                format!(r#"CREATE INDEX IF NOT EXISTS {index_name} ON {name_q} ({column_q})"#);
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        let composite = [
            ("tenant_id", "timestamp"),
            ("principal_id", "action"),
            ("data_classification", "retention_policy"),
            ("target_type", "target_id"),
        ];
        for (a, b) in composite {
            let a_q = quote_ident(a)?;
            let b_q = quote_ident(b)?;
            let index_name = quote_ident(&format!("{name}_{a}_{b}_idx"))?;
            let sql = format!(r#"CREATE INDEX IF NOT EXISTS {index_name} ON {name_q} ({a_q}, {b_q})"#);
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        let hash_index = quote_ident(&format!("{name}_hash_idx"))?;
        sqlx::query(&format!(r#"CREATE INDEX IF NOT EXISTS {hash_index} ON {name_q} USING HASH (hash)"#))
            .execute(&self.pool)
            .await?;

        let gin_index = quote_ident(&format!("{name}_details_gin_idx"))?;
        sqlx::query(&format!(r#"CREATE INDEX IF NOT EXISTS {gin_index} ON {name_q} USING GIN (details)"#))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Drop any partition whose range-end is at or before `now - retention_days`.
    pub async fn drop_expired(&self, retention_days: i64) -> Result<Vec<String>, PartitionError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let names: Vec<(String,)> = sqlx::query_as(
            r#"SELECT tablename FROM pg_tables WHERE tablename LIKE 'audit_log_____\_%' ESCAPE '\'"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut dropped = Vec::new();
        for (name,) in names {
            if let Some((year, month)) = parse_partition_name(&name) {
                let (ny, nm) = next_month(year, month);
                let range_end = month_start(ny, nm);
                if range_end <= cutoff {
                    let name_q = quote_ident(&name)?;
                    sqlx::query(&format!("DROP TABLE IF EXISTS {name_q}")).execute(&self.pool).await?;
                    dropped.push(name);
                }
            }
        }
        Ok(dropped)
    }

    pub async fn list_partitions(&self) -> Result<Vec<PartitionDescriptor>, PartitionError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                c.relname,
                pg_total_relation_size(c.oid) AS size_bytes,
                COALESCE(s.n_live_tup, 0) AS approx_rows
            FROM pg_class c
            LEFT JOIN pg_stat_user_tables s ON s.relname = c.relname
            WHERE c.relname LIKE 'audit_log_____\_%' ESCAPE '\'
            ORDER BY c.relname
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut descriptors = Vec::new();
        for (name, size_bytes, approx_rows) in rows {
            if let Some((year, month)) = parse_partition_name(&name) {
                let (ny, nm) = next_month(year, month);
                descriptors.push(PartitionDescriptor {
                    parent_table: "audit_log".to_string(),
                    partition_name: name,
                    range_start_inclusive: month_start(year, month),
                    range_end_exclusive: month_start(ny, nm),
                    size_bytes,
                    approx_row_count: approx_rows,
                });
            }
        }
        Ok(descriptors)
    }

    pub async fn analyze(&self) -> Result<AnalyzeReport, PartitionError> {
        let partitions = self.list_partitions().await?;
        let total_partitions = partitions.len() as i64;
        let total_size_bytes: i64 = partitions.iter().map(|p| p.size_bytes).sum();
        let total_records: i64 = partitions.iter().map(|p| p.approx_row_count).sum();
        let average_size_bytes =
            if total_partitions > 0 { total_size_bytes as f64 / total_partitions as f64 } else { 0.0 };

        let mut recommendations = Vec::new();
        const ONE_GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        if average_size_bytes > ONE_GIB {
            recommendations.push("consider a shorter partition interval; average partition exceeds 1 GiB".to_string());
        }
        if partitions.iter().any(|p| p.approx_row_count == 0) {
            recommendations.push("clean up empty partitions".to_string());
        }
        if total_partitions > 60 {
            recommendations.push("cap partition count; more than 60 partitions exist".to_string());
        }

        Ok(AnalyzeReport { total_partitions, total_size_bytes, total_records, average_size_bytes, recommendations })
    }
}

fn parse_partition_name(name: &str) -> Option<(i32, u32)> {
    let rest = name.strip_prefix("audit_log_")?;
    let mut parts = rest.split('_');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    Some((year, month))
}
