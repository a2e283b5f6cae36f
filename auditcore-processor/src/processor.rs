//! Reliable Event Processor (spec §4.E): a worker pool that claims jobs
//! from the durable queue, runs them through the circuit breaker wrapping
//! the retry engine, and routes the outcome to storage or the dead-letter
//! handler.

use async_trait::async_trait;
use auditcore::{
    AuditError, AuditEvent, CancelSignal, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState,
    HealthBreakerState, HealthReport, MetricsSnapshot, ProcessorMetrics, ResilienceError, RetryConfig,
    RetryEngine, RetryHistoryEntry,
};
use crate::dlq::DeadLetterHandler;
use crate::metrics_gauge::GaugeSampler;
use auditcore_queue::{DurableQueue, QueuedJob, QueueError};
use auditcore_store::AuditStoreFacade;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Caller-supplied business logic for a single event. Persistence,
/// retry, and circuit-breaking are handled by the processor around this.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Seam over the Audit Store Facade, mirroring the way `TelemetrySink`
/// decouples the processor from a concrete observability backend: tests
/// supply an in-memory sink, production wires `auditcore_store::AuditStoreFacade`.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn insert(&self, event: AuditEvent) -> Result<i64, String>;
}

/// Seam over the Dead-Letter Handler's storage-facing operations.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn enqueue_failed(
        &self,
        event: AuditEvent,
        error_message: String,
        original_job_id: String,
        original_queue_name: String,
        retry_history: Vec<RetryHistoryEntry>,
    ) -> Result<i64, String>;

    async fn depth(&self) -> i64;
}

#[async_trait]
impl AuditSink for AuditStoreFacade {
    async fn insert(&self, event: AuditEvent) -> Result<i64, String> {
        AuditStoreFacade::insert(self, event).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterHandler {
    async fn enqueue_failed(
        &self,
        event: AuditEvent,
        error_message: String,
        original_job_id: String,
        original_queue_name: String,
        retry_history: Vec<RetryHistoryEntry>,
    ) -> Result<i64, String> {
        DeadLetterHandler::enqueue_failed(self, event, error_message, original_job_id, original_queue_name, retry_history)
            .await
            .map_err(|e| e.to_string())
    }

    async fn depth(&self) -> i64 {
        DeadLetterHandler::depth(self).await.unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub queue_name: String,
    pub concurrency: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub gauge_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_name: "audit".to_string(),
            concurrency: 5,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(200),
            grace_period: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            gauge_interval: GaugeSampler::default_interval(),
        }
    }
}

pub struct ReliableEventProcessor {
    queue: Arc<dyn DurableQueue>,
    store: Arc<dyn AuditSink>,
    dlq: Arc<dyn DeadLetterSink>,
    breaker: CircuitBreakerPolicy,
    retry_engine: RetryEngine,
    metrics: Arc<ProcessorMetrics>,
    handler: Arc<dyn EventHandler>,
    config: ProcessorConfig,
    cancel: CancelSignal,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl ReliableEventProcessor {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        store: Arc<dyn AuditSink>,
        dlq: Arc<dyn DeadLetterSink>,
        handler: Arc<dyn EventHandler>,
        config: ProcessorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            breaker: CircuitBreakerPolicy::new(config.breaker.clone()),
            retry_engine: RetryEngine::new(config.retry.clone()),
            metrics: Arc::new(ProcessorMetrics::new()),
            queue,
            store,
            dlq,
            handler,
            config,
            cancel: CancelSignal::new(),
            shutdown_tx,
            shutdown_rx,
            workers: StdMutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Idempotent: a second call while already started is a no-op. Spawns
    /// the worker pool plus a gauge-updater timer that samples queue depth
    /// into `metrics` on `gauge_interval` (spec §4.E, default 30s).
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for worker_id in 0..self.config.concurrency {
            let processor = self.clone();
            let worker_name = format!("worker-{worker_id}");
            let shutdown_rx = self.shutdown_rx.clone();
            workers.push(tokio::spawn(processor.run_worker(worker_name, shutdown_rx)));
        }

        let sampler = GaugeSampler::new(
            self.queue.clone(),
            self.config.queue_name.clone(),
            self.metrics.clone(),
            self.config.gauge_interval,
        );
        workers.push(sampler.spawn(self.shutdown_rx.clone()));
    }

    /// Cooperative shutdown: stop accepting new jobs, let in-flight work
    /// finish up to `grace_period`, then abort stragglers (spec §5).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.workers.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(self.config.grace_period, futures::future::join_all(handles)).await.is_err() {
            tracing::warn!("grace period exceeded, aborting in-flight workers");
            for handle in abort_handles {
                handle.abort();
            }
        }

        self.started.store(false, Ordering::Release);
    }

    pub async fn submit(&self, event: AuditEvent) -> Result<i64, QueueError> {
        self.queue.enqueue(&self.config.queue_name, event).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn health(&self) -> HealthReport {
        let breaker_state = match self.breaker.snapshot().state {
            CircuitState::Closed => HealthBreakerState::Closed,
            CircuitState::Open => HealthBreakerState::Open,
            CircuitState::HalfOpen => HealthBreakerState::HalfOpen,
        };
        let dlq_count = self.dlq.depth().await.max(0) as u64;
        self.metrics.health(breaker_state, dlq_count)
    }

    pub fn processor_metrics(&self) -> Arc<ProcessorMetrics> {
        self.metrics.clone()
    }

    async fn run_worker(self: Arc<Self>, worker_name: String, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            match self.queue.claim(&self.config.queue_name, &worker_name, 1, self.config.lease).await {
                Ok(jobs) if !jobs.is_empty() => {
                    for job in jobs {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        self.process_job(job).await;
                    }
                }
                Ok(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker = %worker_name, error = %e, "failed to claim jobs");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Per-job pipeline (spec §4.E): breaker-outer, retry-inner, then
    /// persist on success or dead-letter on exhausted/circuit-open failure.
    async fn process_job(&self, job: QueuedJob) {
        let start = Instant::now();
        let captured_attempts: Arc<StdMutex<Vec<auditcore::AttemptRecord>>> = Arc::new(StdMutex::new(Vec::new()));
        let transitions_before = self.breaker.snapshot().transitions.len();

        let retry_engine = self.retry_engine.clone();
        let cancel = self.cancel.clone();
        let handler = self.handler.clone();
        let event = job.event.clone();

        let outcome = self
            .breaker
            .execute(|| {
                let retry_engine = retry_engine.clone();
                let cancel = cancel.clone();
                let handler = handler.clone();
                let event = event.clone();
                let attempts_sink = captured_attempts.clone();
                async move {
                    let ro = retry_engine
                        .run(&cancel, || {
                            let handler = handler.clone();
                            let event = event.clone();
                            async move { handler.handle(&event).await }
                        })
                        .await;
                    *attempts_sink.lock().unwrap_or_else(|p| p.into_inner()) = ro.attempts;
                    ro.result
                }
            })
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;

        let transitions_after = self.breaker.snapshot();
        if transitions_after.transitions.len() > transitions_before {
            if let Some(last) = transitions_after.transitions.last() {
                if last.to == CircuitState::Open {
                    self.metrics.record_circuit_breaker_trip();
                }
            }
        }

        let attempts = captured_attempts.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if attempts.len() > 1 {
            self.metrics.record_retries((attempts.len() - 1) as u64);
        }

        match outcome {
            Ok(()) => self.on_success(job, elapsed_ms).await,
            Err(err) => self.on_failure(job, err, elapsed_ms, attempts).await,
        }
    }

    async fn on_success(&self, job: QueuedJob, elapsed_ms: u64) {
        match self.store.insert(job.event.clone()).await {
            Ok(_) => {
                self.metrics.record_processed(true, elapsed_ms);
                if let Err(e) = self.queue.ack(job.id).await {
                    tracing::error!(job_id = job.id, error = %e, "failed to ack processed job");
                }
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "failed to persist processed event, returning to queue");
                self.metrics.record_processed(false, elapsed_ms);
                if let Err(e) = self.queue.nack(job.id).await {
                    tracing::error!(job_id = job.id, error = %e, "failed to nack job after persistence failure");
                }
            }
        }
    }

    async fn on_failure(
        &self,
        job: QueuedJob,
        err: ResilienceError<ResilienceError<AuditError>>,
        elapsed_ms: u64,
        attempts: Vec<auditcore::AttemptRecord>,
    ) {
        self.metrics.record_processed(false, elapsed_ms);

        let retry_history: Vec<RetryHistoryEntry> = attempts
            .iter()
            .filter_map(|a| {
                a.error.clone().map(|message| RetryHistoryEntry {
                    attempt: a.attempt,
                    timestamp: millis_to_datetime(a.at_millis),
                    error_message: message,
                })
            })
            .collect();

        match self
            .dlq
            .enqueue_failed(job.event.clone(), err.to_string(), job.id.to_string(), job.queue_name.clone(), retry_history)
            .await
        {
            Ok(_) => {
                self.metrics.record_dead_letter();
                if let Err(e) = self.queue.ack(job.id).await {
                    tracing::error!(job_id = job.id, error = %e, "failed to ack dead-lettered job");
                }
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "dead-letter write failed, leaving job for lease-based redelivery");
            }
        }
    }
}

fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis as i64).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditcore::EventStatus;
    use auditcore_queue::InMemoryQueue;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    struct FlakyHandler {
        remaining_failures: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                Err(AuditError::transient("ETIMEDOUT", "timed out"))
            } else {
                Ok(())
            }
        }
    }

    struct AlwaysFailHandler;

    #[async_trait]
    impl EventHandler for AlwaysFailHandler {
        async fn handle(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::permanent("schema mismatch"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        inserted: StdMutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        async fn insert(&self, event: AuditEvent) -> Result<i64, String> {
            let mut inserted = self.inserted.lock().unwrap();
            inserted.push(event);
            Ok(inserted.len() as i64)
        }
    }

    #[derive(Default)]
    struct RecordingDlq {
        records: StdMutex<BTreeMap<i64, (AuditEvent, String, Vec<RetryHistoryEntry>)>>,
        next_id: AtomicUsize,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingDlq {
        async fn enqueue_failed(
            &self,
            event: AuditEvent,
            error_message: String,
            _original_job_id: String,
            _original_queue_name: String,
            retry_history: Vec<RetryHistoryEntry>,
        ) -> Result<i64, String> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64;
            self.records.lock().unwrap().insert(id, (event, error_message, retry_history));
            Ok(id)
        }

        async fn depth(&self) -> i64 {
            self.records.lock().unwrap().len() as i64
        }
    }

    fn sample_event() -> AuditEvent {
        AuditEvent::new("tenant-1", "fhir.patient.read", EventStatus::Attempt)
    }

    fn test_processor(handler: Arc<dyn EventHandler>) -> (Arc<ReliableEventProcessor>, Arc<RecordingSink>, Arc<RecordingDlq>) {
        let queue: Arc<dyn DurableQueue> = Arc::new(InMemoryQueue::new());
        let store = Arc::new(RecordingSink::default());
        let dlq = Arc::new(RecordingDlq::default());
        let config = ProcessorConfig {
            retry: RetryConfig { max_retries: 2, base_delay_ms: 1, jitter: false, ..Default::default() },
            ..Default::default()
        };
        let processor = ReliableEventProcessor::new(queue, store.clone(), dlq.clone(), handler, config);
        (processor, store, dlq)
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.grace_period, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn successful_job_is_persisted_and_acked() {
        let (processor, store, dlq) = test_processor(Arc::new(FlakyHandler { remaining_failures: AtomicUsize::new(1) }));
        let job = QueuedJob {
            id: 1,
            queue_name: "audit".to_string(),
            event: sample_event(),
            attempt: 0,
            enqueued_at: Utc::now(),
            lease_expires_at: None,
            worker_id: None,
        };

        processor.process_job(job).await;

        assert_eq!(store.inserted.lock().unwrap().len(), 1);
        assert_eq!(dlq.depth().await, 0);
        assert_eq!(processor.metrics().successfully_processed, 1);
        assert_eq!(processor.metrics().retried_events, 1);
    }

    #[tokio::test]
    async fn permanently_failing_job_is_dead_lettered_not_persisted() {
        let (processor, store, dlq) = test_processor(Arc::new(AlwaysFailHandler));
        let job = QueuedJob {
            id: 7,
            queue_name: "audit".to_string(),
            event: sample_event(),
            attempt: 0,
            enqueued_at: Utc::now(),
            lease_expires_at: None,
            worker_id: None,
        };

        processor.process_job(job).await;

        assert_eq!(store.inserted.lock().unwrap().len(), 0);
        assert_eq!(dlq.depth().await, 1);
        assert_eq!(processor.metrics().failed_processed, 1);
        assert_eq!(processor.metrics().dead_letter_events, 1);
    }

    #[tokio::test]
    async fn health_score_reflects_dlq_backlog() {
        let (processor, _store, _dlq) = test_processor(Arc::new(AlwaysFailHandler));
        for id in 0..3 {
            let job = QueuedJob {
                id,
                queue_name: "audit".to_string(),
                event: sample_event(),
                attempt: 0,
                enqueued_at: Utc::now(),
                lease_expires_at: None,
                worker_id: None,
            };
            processor.process_job(job).await;
        }
        let health = processor.health().await;
        assert_eq!(health.dlq_count, 3);
        assert!(health.score < 100);
    }

    #[tokio::test]
    async fn submit_enqueues_onto_the_configured_queue() {
        let (processor, _store, _dlq) = test_processor(Arc::new(AlwaysFailHandler));
        let id = processor.submit(sample_event()).await.unwrap();
        assert!(id >= 0);
    }

    #[tokio::test]
    async fn start_samples_queue_depth_without_a_caller_built_gauge_sampler() {
        let queue: Arc<dyn DurableQueue> = Arc::new(InMemoryQueue::new());
        let store = Arc::new(RecordingSink::default());
        let dlq = Arc::new(RecordingDlq::default());
        let config = ProcessorConfig {
            concurrency: 0,
            gauge_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let processor =
            ReliableEventProcessor::new(queue, store, dlq, Arc::new(AlwaysFailHandler), config);

        processor.submit(sample_event()).await.unwrap();
        assert_eq!(processor.metrics().queue_depth, 0);

        processor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.stop().await;

        assert_eq!(processor.metrics().queue_depth, 1);
    }
}
