//! Circuit breaker: a three-state failure detector guarding the database
//! sink (spec §4.B).

use crate::clock::{Clock, MonotonicClock};
use crate::error::ResilienceError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

const TRANSITION_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// A recorded state change, kept in a bounded ring buffer (spec §3.1
/// `CircuitBreakerState.transitions`).
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_millis: u64,
    pub reason: &'static str,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub monitoring_period: Duration,
    pub minimum_throughput: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            minimum_throughput: 10,
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never trips, used where the caller wants the policy
    /// shape without the gating behavior.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            monitoring_period: Duration::from_secs(u64::MAX / 1000),
            minimum_throughput: usize::MAX,
        }
    }
}

struct InnerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    request_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    window_started_at_millis: AtomicU64,
    half_open_probing: AtomicUsize,
    transitions: Mutex<VecDeque<StateTransition>>,
}

/// A point-in-time read of the breaker's public state (spec §3.1).
#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: usize,
    pub request_count: usize,
    pub transitions: Vec<StateTransition>,
}

#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<InnerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerPolicy {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(InnerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                request_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                window_started_at_millis: AtomicU64::new(0),
                half_open_probing: AtomicUsize::new(0),
                transitions: Mutex::new(VecDeque::with_capacity(TRANSITION_LOG_CAPACITY)),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: CircuitState::from(self.state.state.load(Ordering::Acquire)),
            failure_count: self.state.failure_count.load(Ordering::Acquire),
            request_count: self.state.request_count.load(Ordering::Acquire),
            transitions: self.state.transitions.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect(),
        }
    }

    fn record_transition(&self, from: CircuitState, to: CircuitState, reason: &'static str) {
        let mut log = self.state.transitions.lock().unwrap_or_else(|p| p.into_inner());
        if log.len() >= TRANSITION_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(StateTransition { from, to, at_millis: self.now_millis(), reason });
    }

    /// Reset the throughput-counting window if `monitoring_period` has
    /// elapsed without a trip (open question resolution: simple counter
    /// reset on trip/close, plus staleness reset — see SPEC_FULL.md §4.B+).
    fn maybe_reset_window(&self) {
        let started = self.state.window_started_at_millis.load(Ordering::Acquire);
        let now = self.now_millis();
        if now.saturating_sub(started) >= self.config.monitoring_period.as_millis() as u64 {
            self.state.window_started_at_millis.store(now, Ordering::Release);
            self.state.request_count.store(0, Ordering::Release);
            self.state.failure_count.store(0, Ordering::Release);
        }
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.maybe_reset_window();

        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker: open -> half-open");
                                self.state.half_open_probing.store(1, Ordering::Release);
                                self.record_transition(CircuitState::Open, CircuitState::HalfOpen, "recovery-timeout-elapsed");
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("invalid circuit breaker state"),
                        }
                    } else {
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_probing.fetch_add(1, Ordering::AcqRel);
                    if current >= 1 {
                        self.state.half_open_probing.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        self.state.request_count.fetch_add(1, Ordering::AcqRel);
        let result = operation().await;

        if was_half_open {
            self.state.half_open_probing.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result.map_err(ResilienceError::Inner)
    }

    fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.request_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker: half-open -> closed");
                    self.record_transition(CircuitState::HalfOpen, CircuitState::Closed, "probe-succeeded");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: probe failed, half-open -> open");
                    self.record_transition(CircuitState::HalfOpen, CircuitState::Open, "probe-failed");
                }
            }
            STATE_CLOSED => {
                let requests = self.state.request_count.load(Ordering::Acquire);
                if failures >= self.config.failure_threshold && requests >= self.config.minimum_throughput {
                    if self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                        tracing::error!(
                            failures,
                            threshold = self.config.failure_threshold,
                            "circuit breaker: closed -> open"
                        );
                        self.record_transition(CircuitState::Closed, CircuitState::Open, "failure-threshold-reached");
                    }
                }
            }
            _ => {}
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);
    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for TestError {}

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }
    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }
        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }
    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn config(threshold: usize, min_throughput: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(100),
            monitoring_period: Duration::from_secs(3600),
            minimum_throughput: min_throughput,
        }
    }

    #[tokio::test]
    async fn closed_breaker_passes_through_and_resets_on_success() {
        let breaker = CircuitBreakerPolicy::new(config(3, 1));
        let result = breaker.execute(|| async { Ok::<_, TestError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn opens_after_threshold_with_sufficient_throughput() {
        let breaker = CircuitBreakerPolicy::new(config(3, 3));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail".into())) }).await;
        }
        let counter = Arc::new(Counter::new(0));
        let c2 = counter.clone();
        let result = breaker
            .execute(|| {
                let c = c2.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn does_not_open_below_minimum_throughput() {
        let breaker = CircuitBreakerPolicy::new(config(3, 100));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail".into())) }).await;
        }
        let result = breaker.execute(|| async { Ok::<_, TestError>(1) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(config(1, 1)).with_clock(clock.clone());
        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail".into())) }).await;
        clock.advance(200);

        let mut handles = vec![];
        for _ in 0..3 {
            let b = breaker.clone();
            handles.push(tokio::spawn(async move {
                b.execute(|| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, TestError>(())
                })
                .await
            }));
        }
        let results: Vec<_> = futures::future::join_all(handles).await;
        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn half_open_success_closes_and_half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(config(1, 1)).with_clock(clock.clone());
        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail".into())) }).await;
        clock.advance(200);
        let _ = breaker.execute(|| async { Ok::<_, TestError>(1) }).await;
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);

        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail".into())) }).await;
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        clock.advance(200);
        let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail again".into())) }).await;
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn records_bounded_transition_log() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(config(1, 1)).with_clock(clock.clone());
        for _ in 0..5 {
            let _ = breaker.execute(|| async { Err::<(), _>(TestError("fail".into())) }).await;
            clock.advance(200);
            let _ = breaker.execute(|| async { Ok::<_, TestError>(1) }).await;
        }
        let snapshot = breaker.snapshot();
        assert!(!snapshot.transitions.is_empty());
        assert!(snapshot.transitions.len() <= TRANSITION_LOG_CAPACITY);
    }
}
