//! Queue-depth gauge sampler (spec §6.3 `metrics.gaugeIntervalMs`, default
//! 30s). Runs as its own task so gauge sampling never competes with worker
//! I/O for a connection-pool slot on the hot path.

use auditcore::ProcessorMetrics;
use auditcore_queue::DurableQueue;
use std::sync::Arc;
use std::time::Duration;

pub struct GaugeSampler {
    queue: Arc<dyn DurableQueue>,
    queue_name: String,
    metrics: Arc<ProcessorMetrics>,
    interval: Duration,
}

impl GaugeSampler {
    pub fn new(queue: Arc<dyn DurableQueue>, queue_name: String, metrics: Arc<ProcessorMetrics>, interval: Duration) -> Self {
        Self { queue, queue_name, metrics, interval }
    }

    pub fn default_interval() -> Duration {
        Duration::from_millis(30_000)
    }

    pub fn spawn(self, mut cancel: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.queue.depth(&self.queue_name).await {
                            Ok(depth) => self.metrics.set_queue_depth(depth),
                            Err(e) => tracing::warn!(error = %e, "failed to sample queue depth"),
                        }
                    }
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditcore::{AuditEvent, EventStatus};
    use auditcore_queue::InMemoryQueue;

    #[tokio::test]
    async fn samples_depth_into_metrics_before_cancellation() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.enqueue("audit", AuditEvent::new("t1", "a", EventStatus::Success)).await.unwrap();
        let metrics = Arc::new(ProcessorMetrics::new());
        let sampler = GaugeSampler::new(queue, "audit".to_string(), metrics.clone(), Duration::from_millis(5));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = sampler.spawn(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(metrics.snapshot().queue_depth, 1);
    }
}
