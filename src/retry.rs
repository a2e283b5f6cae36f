//! Retry engine: bounded retry loop with pluggable backoff, jitter, and
//! error-class gating (spec §4.A).

use crate::clock::{Clock, MonotonicClock};
use crate::error::{
    AuditError, ResilienceError, DEFAULT_RETRYABLE_CODES, DEFAULT_RETRYABLE_SUBSTRINGS,
    MAX_RETRY_FAILURES,
};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::{Backoff, Jitter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Strategy names as they appear in configuration (spec §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
}

/// Configuration for the retry engine, matching spec §4.A and §6.3 `retry.*`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub strategy: RetryStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retryable_codes: Vec<String>,
    pub retryable_message_substrings: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            strategy: RetryStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
            retryable_codes: DEFAULT_RETRYABLE_CODES.iter().map(|s| s.to_string()).collect(),
            retryable_message_substrings: DEFAULT_RETRYABLE_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryConfig {
    fn backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        match self.strategy {
            RetryStrategy::Exponential => Backoff::exponential(base).with_max(max),
            RetryStrategy::Linear => Backoff::linear(base).with_max(max),
            RetryStrategy::Fixed => Backoff::fixed(base).with_max(max),
        }
    }

    fn jitter(&self) -> Jitter {
        if self.jitter { Jitter::bounded_factor() } else { Jitter::None }
    }
}

/// A single attempt's record, returned as part of the overall retry outcome.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: usize,
    pub delay_ms: u64,
    pub error: Option<String>,
    pub at_millis: u64,
    pub cancelled: bool,
}

/// Cooperative cancellation signal shared across a processing pipeline.
///
/// Grounded on the teacher's `Sleeper`/`Clock` test-seam philosophy: a tiny
/// explicit struct rather than an external cancellation-token dependency.
/// Backed by a `watch` channel (not a bare `AtomicBool`) so a pending
/// backoff sleep can be raced against cancellation instead of only being
/// checked at the top of the retry loop.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation fires. Returns immediately if it already
    /// has, so awaiting this never misses a cancel that happened earlier.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// The retry engine. Drives a bounded retry loop around `operation`,
/// classifying errors as retryable/non-retryable and recording a full
/// attempt history.
#[derive(Clone)]
pub struct RetryEngine {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine").field("config", &self.config).finish()
    }
}

/// Outcome of a full retry run: either the handler's success value, or the
/// final `ResilienceError` with the complete attempt history.
pub struct RetryOutcome<T> {
    pub result: Result<T, ResilienceError<AuditError>>,
    pub attempts: Vec<AttemptRecord>,
    pub total_ms: u64,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, sleeper: Arc::new(TokioSleeper), clock: Arc::new(MonotonicClock::default()) }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` under this engine's policy, honoring `cancel` at each
    /// suspension point (spec §4.A "if the caller's cancellation signal
    /// fires, abort immediately").
    pub async fn run<T, Fut, Op>(&self, cancel: &CancelSignal, mut operation: Op) -> RetryOutcome<T>
    where
        T: Send,
        Fut: Future<Output = Result<T, AuditError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let start = self.clock.now_millis();
        let mut attempts = Vec::new();
        let total_tries = self.config.max_retries + 1;
        let backoff = self.config.backoff();
        let jitter = self.config.jitter();

        for attempt in 0..total_tries {
            if cancel.is_cancelled() {
                attempts.push(AttemptRecord {
                    attempt,
                    delay_ms: 0,
                    error: None,
                    at_millis: self.clock.now_millis(),
                    cancelled: true,
                });
                return RetryOutcome {
                    result: Err(ResilienceError::RetryExhausted {
                        attempts: attempt,
                        failures: Vec::new(),
                    }),
                    attempts,
                    total_ms: self.clock.now_millis().saturating_sub(start),
                };
            }

            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        total_ms: self.clock.now_millis().saturating_sub(start),
                    }
                }
                Err(err) => {
                    let retryable = err.is_retryable(
                        &self.config.retryable_codes,
                        &self.config.retryable_message_substrings,
                    );

                    if !retryable {
                        attempts.push(AttemptRecord {
                            attempt,
                            delay_ms: 0,
                            error: Some(err.to_string()),
                            at_millis: self.clock.now_millis(),
                            cancelled: false,
                        });
                        return RetryOutcome {
                            result: Err(ResilienceError::Inner(err)),
                            attempts,
                            total_ms: self.clock.now_millis().saturating_sub(start),
                        };
                    }

                    // Retry budget is checked BEFORE waiting the next delay (spec §4.A).
                    let is_last = attempt + 1 >= total_tries;
                    if is_last {
                        attempts.push(AttemptRecord {
                            attempt,
                            delay_ms: 0,
                            error: Some(err.to_string()),
                            at_millis: self.clock.now_millis(),
                            cancelled: false,
                        });
                        let mut failures = vec![err];
                        if failures.len() > MAX_RETRY_FAILURES {
                            let excess = failures.len() - MAX_RETRY_FAILURES;
                            failures.drain(0..excess);
                        }
                        return RetryOutcome {
                            result: Err(ResilienceError::RetryExhausted {
                                attempts: total_tries,
                                failures,
                            }),
                            attempts,
                            total_ms: self.clock.now_millis().saturating_sub(start),
                        };
                    }

                    let raw_delay = backoff.delay(attempt + 1);
                    let delay = jitter.apply(raw_delay);

                    attempts.push(AttemptRecord {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: Some(err.to_string()),
                        at_millis: self.clock.now_millis(),
                        cancelled: false,
                    });

                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retry engine: attempt failed, backing off"
                    );

                    // Race the backoff against cancellation so a cancel fired mid-sleep
                    // aborts immediately instead of waiting out the remaining delay.
                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            attempts.push(AttemptRecord {
                                attempt: attempt + 1,
                                delay_ms: 0,
                                error: None,
                                at_millis: self.clock.now_millis(),
                                cancelled: true,
                            });
                            return RetryOutcome {
                                result: Err(ResilienceError::RetryExhausted {
                                    attempts: attempt + 1,
                                    failures: Vec::new(),
                                }),
                                attempts,
                                total_ms: self.clock.now_millis().saturating_sub(start),
                            };
                        }
                    }
                }
            }
        }

        unreachable!("retry loop always returns before exhausting total_tries iterations")
    }
}
