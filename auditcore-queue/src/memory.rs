//! In-process `DurableQueue` double with the same claim/lease/ack/nack
//! semantics as `PostgresQueue`, for processor unit tests that shouldn't
//! need a live database.

use crate::{DurableQueue, QueuedJob, QueueError};
use async_trait::async_trait;
use auditcore::AuditEvent;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
}

struct Entry {
    job: QueuedJob,
    status: Status,
}

pub struct InMemoryQueue {
    next_id: AtomicI64,
    entries: Mutex<BTreeMap<i64, Entry>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self { next_id: AtomicI64::new(1), entries: Mutex::new(BTreeMap::new()) }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, queue_name: &str, event: AuditEvent) -> Result<i64, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = QueuedJob {
            id,
            queue_name: queue_name.to_string(),
            event,
            attempt: 0,
            enqueued_at: Utc::now(),
            lease_expires_at: None,
            worker_id: None,
        };
        self.entries.lock().unwrap().insert(id, Entry { job, status: Status::Pending });
        Ok(id)
    }

    async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let mut claimed = Vec::new();

        for entry in entries.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if entry.job.queue_name != queue_name {
                continue;
            }
            let claimable = match entry.status {
                Status::Pending => true,
                Status::Running => entry.job.lease_expires_at.map(|l| l < now).unwrap_or(false),
            };
            if !claimable {
                continue;
            }
            entry.status = Status::Running;
            entry.job.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
            entry.job.worker_id = Some(worker_id.to_string());
            claimed.push(entry.job.clone());
        }

        Ok(claimed)
    }

    async fn extend_lease(&self, job_id: i64, lease: Duration) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if entry.status != Status::Running {
            return Err(QueueError::NotFound(job_id));
        }
        entry.job.lease_expires_at = Some(Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default());
        Ok(())
    }

    async fn ack(&self, job_id: i64) -> Result<(), QueueError> {
        self.entries.lock().unwrap().remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: i64) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        entry.status = Status::Pending;
        entry.job.attempt += 1;
        entry.job.lease_expires_at = None;
        entry.job.worker_id = None;
        Ok(())
    }

    async fn depth(&self, queue_name: &str) -> Result<i64, QueueError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.values().filter(|e| e.job.queue_name == queue_name).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditcore::{AuditEvent, EventStatus};

    fn sample_event() -> AuditEvent {
        AuditEvent::new("tenant-1", "fhir.patient.read", EventStatus::Success)
    }

    #[tokio::test]
    async fn claim_is_exclusive_between_workers() {
        let queue = InMemoryQueue::new();
        queue.enqueue("audit", sample_event()).await.unwrap();

        let claimed_a = queue.claim("audit", "worker-a", 10, Duration::from_secs(30)).await.unwrap();
        let claimed_b = queue.claim("audit", "worker-b", 10, Duration::from_secs(30)).await.unwrap();

        assert_eq!(claimed_a.len(), 1);
        assert_eq!(claimed_b.len(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue("audit", sample_event()).await.unwrap();
        queue.claim("audit", "worker-a", 10, Duration::from_millis(0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        let reclaimed = queue.claim("audit", "worker-b", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, id);
    }

    #[tokio::test]
    async fn nack_increments_attempt_and_returns_to_pending() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue("audit", sample_event()).await.unwrap();
        queue.claim("audit", "worker-a", 10, Duration::from_secs(30)).await.unwrap();
        queue.nack(id).await.unwrap();

        let claimed = queue.claim("audit", "worker-b", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed[0].attempt, 1);
    }

    #[tokio::test]
    async fn ack_removes_job_from_depth() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue("audit", sample_event()).await.unwrap();
        assert_eq!(queue.depth("audit").await.unwrap(), 1);
        queue.ack(id).await.unwrap();
        assert_eq!(queue.depth("audit").await.unwrap(), 0);
    }
}
