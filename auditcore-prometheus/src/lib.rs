//! Prometheus sink for the audit pipeline.
//! Bring your own `prometheus::Registry`; counters and gauges are registered
//! and incremented/set as events and metric snapshots arrive.

use auditcore::{MetricsSnapshot, ProcessorMetrics, TelemetryEvent};
use prometheus::{Gauge, IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new("auditcore_events_total", "Audit pipeline events"),
            &["kind", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<TelemetryEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: TelemetryEvent) -> Self::Future {
        let (kind, label) = match &event {
            TelemetryEvent::RetryAttempt(_) => ("retry", "attempt"),
            TelemetryEvent::RetryExhausted { .. } => ("retry", "exhausted"),
            TelemetryEvent::CircuitBreaker(e) => ("circuit_breaker", breaker_label(e.to)),
            TelemetryEvent::Processed(_) => ("processed", "ok"),
            TelemetryEvent::DeadLettered(_) => ("dead_letter", "enqueued"),
        };
        self.counter.with_label_values(&[kind, label]).inc();
        ready(Ok(()))
    }
}

fn breaker_label(to: &'static str) -> &'static str {
    match to {
        "open" | "Open" => "opened",
        "half_open" | "HalfOpen" => "half_open",
        _ => "closed",
    }
}

/// Mirrors `ProcessorMetrics`'s counters and gauges as Prometheus metrics.
/// Not a `Service`, since it's driven by polling `snapshot()` rather than by
/// individual events (spec §4.D: gauges are sampled, not pushed per-event).
#[derive(Clone, Debug)]
pub struct PrometheusMetricsExporter {
    registry: Arc<Registry>,
    total_processed: Gauge,
    successfully_processed: Gauge,
    failed_processed: Gauge,
    retried_events: Gauge,
    dead_letter_events: Gauge,
    circuit_breaker_trips: Gauge,
    queue_depth: Gauge,
    average_processing_ms: Gauge,
}

impl PrometheusMetricsExporter {
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let exporter = Self {
            total_processed: register_gauge(&registry, "auditcore_total_processed", "Total events processed")?,
            successfully_processed: register_gauge(
                &registry,
                "auditcore_successfully_processed",
                "Events processed successfully",
            )?,
            failed_processed: register_gauge(&registry, "auditcore_failed_processed", "Events that failed processing")?,
            retried_events: register_gauge(&registry, "auditcore_retried_events", "Retry attempts made")?,
            dead_letter_events: register_gauge(&registry, "auditcore_dead_letter_events", "Events dead-lettered")?,
            circuit_breaker_trips: register_gauge(
                &registry,
                "auditcore_circuit_breaker_trips",
                "Circuit breaker open transitions",
            )?,
            queue_depth: register_gauge(&registry, "auditcore_queue_depth", "Current queue depth")?,
            average_processing_ms: register_gauge(
                &registry,
                "auditcore_average_processing_ms",
                "Rolling average processing latency in milliseconds",
            )?,
            registry,
        };
        Ok(exporter)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sample(&self, metrics: &ProcessorMetrics) {
        self.observe(&metrics.snapshot());
    }

    pub fn observe(&self, snapshot: &MetricsSnapshot) {
        self.total_processed.set(snapshot.total_processed as f64);
        self.successfully_processed.set(snapshot.successfully_processed as f64);
        self.failed_processed.set(snapshot.failed_processed as f64);
        self.retried_events.set(snapshot.retried_events as f64);
        self.dead_letter_events.set(snapshot.dead_letter_events as f64);
        self.circuit_breaker_trips.set(snapshot.circuit_breaker_trips as f64);
        self.queue_depth.set(snapshot.queue_depth as f64);
        self.average_processing_ms.set(snapshot.average_processing_ms);
    }
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}
