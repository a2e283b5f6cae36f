//! Telemetry event model for the audit pipeline.
//!
//! Mirrors the teacher's `PolicyEvent`/`TelemetrySink` design: a closed
//! event enum plus a `tower_service::Service<TelemetryEvent>`-shaped sink
//! trait, so a single sink can observe both generic resilience events
//! (retry, circuit breaker) and audit-domain events (processed,
//! dead-lettered).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_service::Service;

#[derive(Debug, Clone)]
pub struct RetryAttemptEvent {
    pub attempt: usize,
    pub delay_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerEvent {
    pub from: &'static str,
    pub to: &'static str,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct ProcessorOutcomeEvent {
    pub job_id: String,
    pub tenant_id: String,
    pub processing_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    pub job_id: String,
    pub reason: String,
    pub failure_count: u32,
}

/// Every telemetry-worthy occurrence in the pipeline.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    RetryAttempt(RetryAttemptEvent),
    RetryExhausted { attempts: usize },
    CircuitBreaker(CircuitBreakerEvent),
    Processed(ProcessorOutcomeEvent),
    DeadLettered(DeadLetterEvent),
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEvent::RetryAttempt(e) => {
                write!(f, "retry attempt {} (delay {}ms)", e.attempt, e.delay_ms)
            }
            TelemetryEvent::RetryExhausted { attempts } => {
                write!(f, "retry exhausted after {} attempts", attempts)
            }
            TelemetryEvent::CircuitBreaker(e) => write!(f, "breaker {} -> {} ({})", e.from, e.to, e.reason),
            TelemetryEvent::Processed(e) => write!(f, "processed {} in {}ms", e.job_id, e.processing_ms),
            TelemetryEvent::DeadLettered(e) => write!(f, "dead-lettered {} ({})", e.job_id, e.reason),
        }
    }
}

/// A sink for telemetry events, implemented as a `tower_service::Service` so
/// adapters (Prometheus, log, multicast) compose the same way the teacher's
/// resilience sinks do.
pub trait TelemetrySink:
    Service<
        TelemetryEvent,
        Response = (),
        Future = Pin<Box<dyn Future<Output = Result<(), <Self as Service<TelemetryEvent>>::Error>> + Send>>,
    > + Send
    + Sync
{
}

impl<T> TelemetrySink for T where
    T: Service<
            TelemetryEvent,
            Response = (),
            Future = Pin<Box<dyn Future<Output = Result<(), <T as Service<TelemetryEvent>>::Error>> + Send>>,
        > + Send
        + Sync
{
}

/// Emit without blocking the caller on sink backpressure; drops the event
/// (logging at debug) if the sink isn't ready within a short grace window.
pub async fn emit_best_effort<S>(sink: &mut S, event: TelemetryEvent)
where
    S: TelemetrySink<Error = std::convert::Infallible>,
{
    let ready =
        tokio::time::timeout(Duration::from_millis(50), std::future::poll_fn(|cx: &mut Context<'_>| sink.poll_ready(cx)))
            .await;
    match ready {
        Ok(Ok(())) => {
            let _ = sink.call(event).await;
        }
        _ => {
            tracing::debug!(event = %event, "telemetry sink not ready, dropping event");
        }
    }
}

/// Tracing-backed sink: logs every event at `info` and never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl Service<TelemetryEvent> for TracingSink {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: TelemetryEvent) -> Self::Future {
        tracing::info!(event = %event, "telemetry");
        Box::pin(async { Ok(()) })
    }
}

/// Sink that does nothing; used as a default when no observability backend
/// is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Service<TelemetryEvent> for NullSink {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: TelemetryEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}
