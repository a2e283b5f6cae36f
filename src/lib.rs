#![forbid(unsafe_code)]

//! Core resilience and domain primitives for the compliance-grade audit
//! event pipeline: retry with pluggable backoff, a lock-free circuit
//! breaker, telemetry event plumbing, the audit event data model, and the
//! processor metrics collector.
//!
//! The durable queue, storage (partitioning, integrity, dead-letter
//! persistence), and the worker-pool processor that wires these pieces
//! together live in the `auditcore-queue`, `auditcore-store`, and
//! `auditcore-processor` crates respectively.

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod domain;
pub mod error;
pub mod jitter;
pub mod metrics;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

pub use backoff::Backoff;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerSnapshot, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use domain::{
    AuditEvent, DataClassification, DeadLetterRecord, DetailsValue, EventStatus, IntegrityVerification,
    PartitionDescriptor, RetentionPolicy, RetryHistoryEntry, VerificationStatus,
};
pub use error::{AuditError, ResilienceError};
pub use jitter::Jitter;
pub use metrics::{HealthBreakerState, HealthReport, MetricsSnapshot, ProcessorMetrics};
pub use retry::{AttemptRecord, CancelSignal, RetryConfig, RetryEngine, RetryOutcome, RetryStrategy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{
    CircuitBreakerEvent, DeadLetterEvent, NullSink, ProcessorOutcomeEvent, RetryAttemptEvent, TelemetryEvent,
    TelemetrySink, TracingSink,
};
