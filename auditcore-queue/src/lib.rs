//! Durable queue contract (spec §6.2) that decouples the Reliable Event
//! Processor from whatever backs the job table. `PostgresQueue` is the
//! production implementation; `InMemoryQueue` is a test double with the
//! same claim/lease/ack/nack semantics, used by `auditcore-processor`'s
//! unit tests where a live database isn't available.

mod memory;
mod postgres;

pub use memory::InMemoryQueue;
pub use postgres::PostgresQueue;

use async_trait::async_trait;
use auditcore::AuditEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A unit of queued work: an audit event plus the queue bookkeeping the
/// processor needs to claim, lease, and eventually ack or nack it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: i64,
    pub queue_name: String,
    pub event: AuditEvent,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("job {0} not found or not leased by this worker")]
    NotFound(i64),
}

/// Durable queue contract (spec §6.2): enqueue, atomically claim a batch
/// with a lease, acknowledge success, negatively acknowledge for redelivery
/// or dead-lettering, and report current depth.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, queue_name: &str, event: AuditEvent) -> Result<i64, QueueError>;

    /// Atomically claim up to `limit` jobs that are pending or whose lease
    /// has expired, marking them running and leased to `worker_id`.
    async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        limit: usize,
        lease: std::time::Duration,
    ) -> Result<Vec<QueuedJob>, QueueError>;

    /// Heartbeat a long-running job's lease.
    async fn extend_lease(&self, job_id: i64, lease: std::time::Duration) -> Result<(), QueueError>;

    /// Mark a job done; removes it from the active queue.
    async fn ack(&self, job_id: i64) -> Result<(), QueueError>;

    /// Return a job to `pending` for redelivery, incrementing its attempt
    /// counter. Callers decide whether to route to the dead-letter handler
    /// instead of calling this once the retry budget is exhausted.
    async fn nack(&self, job_id: i64) -> Result<(), QueueError>;

    /// Number of pending-or-running jobs in `queue_name`.
    async fn depth(&self, queue_name: &str) -> Result<i64, QueueError>;
}
