use auditcore::{
    AuditError, CancelSignal, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, RetryConfig, RetryEngine,
    RetryStrategy, TrackingSleeper,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn transient(code: &str) -> AuditError {
    AuditError::transient(code, format!("{code} during handler call"))
}

/// S2: transient failure then recovery, deterministic delays.
#[tokio::test]
async fn transient_failure_then_recovery_observes_exponential_delays() {
    let calls = AtomicUsize::new(0);
    let sleeper = TrackingSleeper::new();
    let config = RetryConfig {
        max_retries: 5,
        strategy: RetryStrategy::Exponential,
        base_delay_ms: 10,
        max_delay_ms: 100,
        jitter: false,
        ..RetryConfig::default()
    };
    let engine = RetryEngine::new(config).with_sleeper(sleeper.clone());
    let cancel = CancelSignal::new();

    let outcome = engine
        .run(&cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient("ETIMEDOUT"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(outcome.result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(sleeper.calls(), 2);
    assert_eq!(sleeper.call_at(0), Some(Duration::from_millis(10)));
    assert_eq!(sleeper.call_at(1), Some(Duration::from_millis(20)));
}

/// S3 (partial, no store): retry exhausted after maxRetries+1 calls.
#[tokio::test]
async fn retry_exhausted_performs_exactly_max_retries_plus_one_calls() {
    let calls = AtomicUsize::new(0);
    let config = RetryConfig { max_retries: 3, jitter: false, base_delay_ms: 1, ..RetryConfig::default() };
    let engine = RetryEngine::new(config).with_sleeper(auditcore::InstantSleeper);
    let cancel = CancelSignal::new();

    let outcome = engine
        .run(&cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(transient("ECONNRESET")) }
        })
        .await;

    assert!(outcome.result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.attempts.len(), 4);
}

/// S4: non-retryable error short-circuits to a single call.
#[tokio::test]
async fn non_retryable_error_performs_exactly_one_call() {
    let calls = AtomicUsize::new(0);
    let config = RetryConfig::default();
    let engine = RetryEngine::new(config).with_sleeper(auditcore::InstantSleeper);
    let cancel = CancelSignal::new();

    let outcome = engine
        .run(&cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AuditError::permanent("schema mismatch")) }
        })
        .await;

    assert!(outcome.result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// S5: breaker trips after minimumThroughput failing calls and fast-fails
/// until recoveryTimeoutMs elapses, then half-opens on the next call.
#[tokio::test]
async fn breaker_trips_and_fast_fails_until_recovery_timeout() {
    let config = CircuitBreakerConfig {
        failure_threshold: 3,
        minimum_throughput: 3,
        recovery_timeout: Duration::from_millis(50),
        monitoring_period: Duration::from_secs(60),
    };
    let breaker = CircuitBreakerPolicy::new(config);

    for _ in 0..3 {
        let _ = breaker.execute(|| async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) }).await;
    }
    assert_eq!(breaker.snapshot().state, CircuitState::Open);

    let fast_failed = breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
    assert!(fast_failed.is_err());

    tokio::time::sleep(Duration::from_millis(60)).await;

    let recovered = breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
    assert!(recovered.is_ok());
    assert_eq!(breaker.snapshot().state, CircuitState::Closed);
}

/// Universal invariant 5(c): a success in the closed state resets the
/// failure counter so a prior near-miss doesn't carry forward.
#[tokio::test]
async fn closed_state_resets_failure_count_on_success() {
    let config = CircuitBreakerConfig {
        failure_threshold: 3,
        minimum_throughput: 1,
        recovery_timeout: Duration::from_millis(50),
        monitoring_period: Duration::from_secs(60),
    };
    let breaker = CircuitBreakerPolicy::new(config);

    let _ = breaker.execute(|| async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) }).await;
    let _ = breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
    assert_eq!(breaker.snapshot().failure_count, 0);
}

/// Boundary: minimumThroughput unmet means the breaker never trips, even
/// with all failures.
#[tokio::test]
async fn breaker_does_not_trip_below_minimum_throughput() {
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        minimum_throughput: 10,
        recovery_timeout: Duration::from_millis(50),
        monitoring_period: Duration::from_secs(60),
    };
    let breaker = CircuitBreakerPolicy::new(config);

    for _ in 0..5 {
        let _ = breaker.execute(|| async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) }).await;
    }

    assert_eq!(breaker.snapshot().state, CircuitState::Closed);
}

/// Boundary: maxRetries = 0 means a single attempt, no retry.
#[tokio::test]
async fn zero_max_retries_performs_a_single_attempt() {
    let calls = AtomicUsize::new(0);
    let config = RetryConfig { max_retries: 0, ..RetryConfig::default() };
    let engine = RetryEngine::new(config).with_sleeper(auditcore::InstantSleeper);
    let cancel = CancelSignal::new();

    let outcome = engine
        .run(&cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(transient("ETIMEDOUT")) }
        })
        .await;

    assert!(outcome.result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Cooperative cancellation aborts the retry loop immediately.
#[tokio::test]
async fn cancellation_aborts_retry_loop_before_further_attempts() {
    let calls = AtomicUsize::new(0);
    let config = RetryConfig { max_retries: 5, ..RetryConfig::default() };
    let engine = RetryEngine::new(config).with_sleeper(auditcore::InstantSleeper);
    let cancel = CancelSignal::new();
    cancel.cancel();

    let outcome = engine
        .run(&cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(transient("ETIMEDOUT")) }
        })
        .await;

    assert!(outcome.result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
