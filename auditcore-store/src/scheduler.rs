//! Partition Maintenance Scheduler (spec §4.G): composes `PartitionManager`
//! on a fixed interval. The overlap guard is a single `AtomicBool` rather
//! than `DeadLetterProcessor`'s `RwLock<bool>` run-flag, since a tick here
//! only ever needs a single compare-and-swap, not a readable "still
//! running" flag consulted from elsewhere.

use crate::partition::{PartitionError, PartitionManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub auto_create: bool,
    pub auto_drop: bool,
    pub create_ahead_months: u32,
    pub retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(86_400_000),
            auto_create: true,
            auto_drop: true,
            create_ahead_months: 6,
            retention_days: 2555,
        }
    }
}

pub struct PartitionScheduler {
    manager: Arc<PartitionManager>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
}

impl PartitionScheduler {
    pub fn new(manager: Arc<PartitionManager>, config: SchedulerConfig) -> Self {
        Self { manager, config, running: Arc::new(AtomicBool::new(false)) }
    }

    /// Spawn the maintenance loop. Returns a handle that can be aborted to
    /// stop scheduling further ticks.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let config = self.config.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            loop {
                ticker.tick().await;
                run_tick(&manager, &config, &running).await;
            }
        })
    }

    /// Run a single tick synchronously, honoring the overlap guard. Exposed
    /// for tests and for callers who want to drive ticks manually.
    pub async fn tick(&self) {
        run_tick(&self.manager, &self.config, &self.running).await;
    }
}

async fn run_tick(manager: &PartitionManager, config: &SchedulerConfig, running: &AtomicBool) {
    if running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
        tracing::warn!("partition maintenance tick skipped: previous tick still running");
        return;
    }

    let result = run_maintenance(manager, config).await;
    running.store(false, Ordering::Release);

    if let Err(e) = result {
        tracing::error!(error = %e, "partition maintenance tick failed");
    }
}

async fn run_maintenance(manager: &PartitionManager, config: &SchedulerConfig) -> Result<(), PartitionError> {
    if config.auto_create {
        let created = manager.create_partitions_ahead(config.create_ahead_months).await?;
        if !created.is_empty() {
            tracing::info!(created = ?created, "created partitions");
        }
    }

    if config.auto_drop {
        let dropped = manager.drop_expired(config.retention_days).await?;
        if !dropped.is_empty() {
            tracing::info!(dropped = ?dropped, "dropped expired partitions");
        }
    }

    let report = manager.analyze().await?;
    tracing::info!(
        total_partitions = report.total_partitions,
        total_size_bytes = report.total_size_bytes,
        total_records = report.total_records,
        recommendations = ?report.recommendations,
        "partition analysis"
    );

    Ok(())
}
