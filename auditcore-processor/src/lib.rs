//! Worker pool, dead-letter routing, and health reporting for the audit
//! pipeline, built on the queue contract in `auditcore_queue` and the
//! storage facade in `auditcore_store`.

pub mod dlq;
pub mod metrics_gauge;
pub mod processor;

pub use dlq::{AlertSink, DeadLetterConfig, DeadLetterHandler, LogAlertSink};
pub use metrics_gauge::GaugeSampler;
pub use processor::{AuditSink, DeadLetterSink, EventHandler, ProcessorConfig, ReliableEventProcessor};
