//! Dead-Letter Handler, operator half (spec §4.C): alerting and
//! operator-triggered reprocessing on top of `auditcore_store::DeadLetterStore`.
//! The alert cooldown is a flag plus a last-fired timestamp rather than a
//! token-bucket, since the spec only asks for "at most one alert per
//! cooldown window," not a rate.

use async_trait::async_trait;
use auditcore::{AuditEvent, DeadLetterRecord, RetryHistoryEntry};
use auditcore_queue::DurableQueue;
use auditcore_store::{DeadLetterMetrics, DeadLetterStore, DeadLetterStoreError};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub alert_threshold: i64,
    pub cooldown: Duration,
    pub max_retention_days: i64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { alert_threshold: 10, cooldown: Duration::from_millis(300_000), max_retention_days: 30 }
    }
}

/// Operator alert channel. Implementations should not block the caller for
/// long; `enqueue_failed` awaits this before returning.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, message: String);
}

/// Logs at `error` level and nothing else; the default when no paging
/// integration is configured.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, message: String) {
        tracing::error!(%message, "dead-letter alert");
    }
}

/// Pure decision function behind `maybe_alert`: fire when depth has
/// crossed the threshold and either no alert is currently firing, or the
/// cooldown window since the last alert has elapsed.
fn should_alert(depth: i64, threshold: i64, firing: bool, last_alert_millis: i64, now_millis: i64, cooldown_ms: i64) -> bool {
    if depth < threshold {
        return false;
    }
    !firing || now_millis - last_alert_millis >= cooldown_ms
}

pub struct DeadLetterHandler {
    store: DeadLetterStore,
    queue: Arc<dyn DurableQueue>,
    config: DeadLetterConfig,
    alert_sink: Arc<dyn AlertSink>,
    alert_firing: AtomicBool,
    last_alert_at_millis: AtomicI64,
}

impl DeadLetterHandler {
    pub fn new(
        store: DeadLetterStore,
        queue: Arc<dyn DurableQueue>,
        config: DeadLetterConfig,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            alert_sink,
            alert_firing: AtomicBool::new(false),
            last_alert_at_millis: AtomicI64::new(0),
        }
    }

    /// Store a failed job durably, then fire an alert if depth has reached
    /// `alert_threshold` and the cooldown has elapsed. A DLQ write failure
    /// is retried a bounded number of times; if it still fails, the
    /// original failure is never dropped silently — it is logged and
    /// alerted on directly (spec §4.C failure semantics).
    pub async fn enqueue_failed(
        &self,
        event: AuditEvent,
        error_message: String,
        original_job_id: String,
        original_queue_name: String,
        retry_history: Vec<RetryHistoryEntry>,
    ) -> Result<i64, DeadLetterStoreError> {
        let now = Utc::now();
        let record = DeadLetterRecord {
            id: None,
            original_event: event,
            failure_reason: error_message.clone(),
            failure_count: retry_history.len() as u32,
            first_failure_at: now,
            last_failure_at: now,
            original_job_id: original_job_id.clone(),
            original_queue_name,
            error_stack: Some(error_message),
            retry_history,
        };

        const MAX_WRITE_ATTEMPTS: usize = 3;
        let mut last_err = None;
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            match self.store.enqueue_failed(&record).await {
                Ok(id) => {
                    self.maybe_alert().await;
                    return Ok(id);
                }
                Err(e) => {
                    tracing::warn!(attempt, job_id = %original_job_id, error = %e, "dead-letter write failed, retrying");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.expect("loop ran at least once");
        self.alert_sink
            .alert(format!("dead-letter write failed permanently for job {original_job_id}: {err}"))
            .await;
        Err(err)
    }

    async fn maybe_alert(&self) {
        let depth = match self.store.depth().await {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "failed to read dead-letter depth for alert check");
                return;
            }
        };

        let now_millis = Utc::now().timestamp_millis();
        let last = self.last_alert_at_millis.load(Ordering::Acquire);
        let firing = self.alert_firing.load(Ordering::Acquire);

        if should_alert(depth, self.config.alert_threshold, firing, last, now_millis, self.config.cooldown.as_millis() as i64) {
            self.alert_firing.store(true, Ordering::Release);
            self.last_alert_at_millis.store(now_millis, Ordering::Release);
            self.alert_sink.alert(format!("dead-letter queue depth {depth} at or above threshold")).await;
        }
    }

    pub async fn metrics(&self) -> Result<DeadLetterMetrics, DeadLetterStoreError> {
        self.store.metrics().await
    }

    pub async fn depth(&self) -> Result<i64, DeadLetterStoreError> {
        self.store.depth().await
    }

    /// Operator-triggered reprocess: re-publish to the source queue with a
    /// fresh attempt counter, then remove from the dead-letter store.
    /// Idempotent by id: if the record is already gone, this is a no-op.
    pub async fn reprocess(&self, id: i64) -> Result<(), DeadLetterStoreError> {
        let record = match self.store.get(id).await {
            Ok(r) => r,
            Err(DeadLetterStoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        self.queue
            .enqueue(&record.original_queue_name, record.original_event)
            .await
            .map_err(|e| DeadLetterStoreError::Database(e.to_string()))?;

        self.store.remove(id).await
    }

    pub async fn enforce_retention(&self) -> Result<i64, DeadLetterStoreError> {
        self.store.enforce_retention(self.config.max_retention_days).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditcore::EventStatus;
    use auditcore_queue::InMemoryQueue;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CapturingAlertSink {
        messages: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertSink for CapturingAlertSink {
        async fn alert(&self, message: String) {
            self.messages.lock().unwrap().push(message);
        }
    }

    fn sample_event() -> AuditEvent {
        AuditEvent::new("tenant-1", "fhir.patient.read", EventStatus::Failure)
    }

    #[test]
    fn does_not_alert_below_threshold() {
        assert!(!should_alert(5, 10, false, 0, 1_000_000, 300_000));
    }

    #[test]
    fn alerts_once_when_crossing_threshold_while_not_firing() {
        assert!(should_alert(10, 10, false, 0, 1_000_000, 300_000));
    }

    #[test]
    fn suppresses_repeat_alert_within_cooldown() {
        let last_alert = 1_000_000;
        let still_within_cooldown = last_alert + 100_000;
        assert!(!should_alert(15, 10, true, last_alert, still_within_cooldown, 300_000));
    }

    #[test]
    fn re_alerts_once_cooldown_elapses() {
        let last_alert = 1_000_000;
        let past_cooldown = last_alert + 300_001;
        assert!(should_alert(15, 10, true, last_alert, past_cooldown, 300_000));
    }

    #[tokio::test]
    async fn enqueue_onto_a_named_queue_is_observable_via_depth() {
        let queue: Arc<dyn DurableQueue> = Arc::new(InMemoryQueue::new());
        let event = sample_event();
        queue.enqueue("audit", event).await.unwrap();
        assert_eq!(queue.depth("audit").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn capturing_sink_records_alert_messages() {
        let sink = CapturingAlertSink::default();
        sink.alert("dead-letter queue depth 12 at or above threshold".to_string()).await;
        assert_eq!(sink.messages.lock().unwrap().len(), 1);
    }
}
