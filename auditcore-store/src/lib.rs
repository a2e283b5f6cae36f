//! Partitioned Postgres storage for the audit pipeline: the Audit Store
//! Facade (insert/verify/read), the Partition Manager and its scheduler,
//! integrity hashing, and dead-letter persistence.

pub mod dead_letter;
pub mod facade;
pub mod integrity;
pub mod partition;
pub mod scheduler;

pub use dead_letter::{DeadLetterMetrics, DeadLetterStore, DeadLetterStoreError};
pub use facade::{AuditEventRow, AuditStoreFacade, StoreError};
pub use integrity::{compute_hash, verify, verify_record, VerificationOutcome, HASH_ALGORITHM};
pub use partition::{AnalyzeReport, PartitionError, PartitionManager};
pub use scheduler::{PartitionScheduler, SchedulerConfig};
