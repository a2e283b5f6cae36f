//! Processor Metrics Collector (spec §4.D): monotonic counters, a rolling
//! latency window, and gauges.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

const LATENCY_WINDOW_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct ProcessorMetrics {
    total_processed: AtomicU64,
    successfully_processed: AtomicU64,
    failed_processed: AtomicU64,
    retried_events: AtomicU64,
    dead_letter_events: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    queue_depth: AtomicI64,
    last_processed_at_millis: AtomicI64,
    latencies: Mutex<VecDeque<u64>>,
}

impl Default for ProcessorMetrics {
    fn default() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            successfully_processed: AtomicU64::new(0),
            failed_processed: AtomicU64::new(0),
            retried_events: AtomicU64::new(0),
            dead_letter_events: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
            queue_depth: AtomicI64::new(0),
            last_processed_at_millis: AtomicI64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_CAPACITY)),
        }
    }
}

/// A point-in-time read of the counters, for `metrics()`/`health()`.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub successfully_processed: u64,
    pub failed_processed: u64,
    pub retried_events: u64,
    pub dead_letter_events: u64,
    pub circuit_breaker_trips: u64,
    pub queue_depth: i64,
    pub average_processing_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, success: bool, processing_ms: u64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successfully_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_processed.fetch_add(1, Ordering::Relaxed);
        }
        self.push_latency(processing_ms);
        self.last_processed_at_millis.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries(&self, n: u64) {
        self.retried_events.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letter_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Gauges are last-writer-wins (spec §4.D).
    pub fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    fn push_latency(&self, ms: u64) {
        let mut window = self.latencies.lock().unwrap_or_else(|p| p.into_inner());
        if window.len() >= LATENCY_WINDOW_CAPACITY {
            window.pop_front();
        }
        window.push_back(ms);
    }

    fn average_latency(&self) -> f64 {
        let window = self.latencies.lock().unwrap_or_else(|p| p.into_inner());
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<u64>() as f64 / window.len() as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last = self.last_processed_at_millis.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_processed: self.total_processed.load(Ordering::Relaxed),
            successfully_processed: self.successfully_processed.load(Ordering::Relaxed),
            failed_processed: self.failed_processed.load(Ordering::Relaxed),
            retried_events: self.retried_events.load(Ordering::Relaxed),
            dead_letter_events: self.dead_letter_events.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            average_processing_ms: self.average_latency(),
            last_processed_at: if last == 0 { None } else { DateTime::from_timestamp_millis(last) },
            timestamp: Utc::now(),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.total_processed.load(Ordering::Relaxed).max(1);
        self.failed_processed.load(Ordering::Relaxed) as f64 / total as f64
    }
}

/// Breaker state as seen by the health score formula (spec §4.E), decoupled
/// from `crate::circuit_breaker::CircuitState` so this module has no
/// dependency on the breaker's internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// `{score, breakerState, queueDepth, failureRate, dlqCount}` (spec §4.E).
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub score: u8,
    pub breaker_state: HealthBreakerState,
    pub queue_depth: i64,
    pub failure_rate: f64,
    pub dlq_count: u64,
}

/// Compute the health score exactly per spec §4.E.
pub fn health_score(
    breaker_state: HealthBreakerState,
    failure_rate: f64,
    dlq_count: u64,
    queue_depth: i64,
) -> u8 {
    let mut penalties: f64 = 0.0;

    penalties += match breaker_state {
        HealthBreakerState::Open => 30.0,
        HealthBreakerState::HalfOpen => 15.0,
        HealthBreakerState::Closed => 0.0,
    };

    if failure_rate > 0.1 {
        penalties += (failure_rate * 100.0).min(30.0);
    }

    if dlq_count > 0 {
        penalties += (dlq_count as f64).min(20.0);
    }

    if queue_depth > 100 {
        penalties += (queue_depth as f64 / 10.0).min(20.0);
    }

    let score = (100.0 - penalties).clamp(0.0, 100.0).round();
    score as u8
}

impl ProcessorMetrics {
    pub fn health(&self, breaker_state: HealthBreakerState, dlq_count: u64) -> HealthReport {
        let snapshot = self.snapshot();
        let score = health_score(breaker_state, self.failure_rate(), dlq_count, snapshot.queue_depth);
        HealthReport {
            score,
            breaker_state,
            queue_depth: snapshot.queue_depth,
            failure_rate: self.failure_rate(),
            dlq_count,
        }
    }
}
