//! Seam the retry engine waits through for a backoff delay. Swapping this
//! for a no-op or recording implementation is what lets `RetryEngine`'s
//! tests assert exact delay sequences without a single real-time wait.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Anything that can wait out a `Duration`. `RetryEngine::run` races this
/// against `CancelSignal::cancelled`, so an implementation only needs to
/// resolve after `duration` elapses — it doesn't need to be cancel-aware
/// itself.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Waits on the tokio timer wheel. What every non-test caller uses.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Records every requested duration without waiting, so a test can assert
/// the backoff sequence (`call_at(0)`, `call_at(1)`, ...) a retry run
/// produced.
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).get(index).copied()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(duration);
    }
}

/// Skips the wait entirely. For tests that only care about the retry
/// outcome (call count, final error) and would rather not assert on
/// specific delays.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}
