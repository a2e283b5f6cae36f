use auditcore::{CircuitBreakerConfig, CircuitBreakerPolicy};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

fn circuit_breaker_throughput_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = CircuitBreakerConfig {
        failure_threshold: 10,
        recovery_timeout: Duration::from_secs(30),
        monitoring_period: Duration::from_secs(60),
        minimum_throughput: 10,
    };
    let breaker = CircuitBreakerPolicy::new(config);

    c.bench_function("circuit_breaker_success_path", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(breaker.execute(|| async { Ok::<_, std::io::Error>("ok") }).await);
        });
    });
}

fn circuit_breaker_throughput_open(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(30),
        monitoring_period: Duration::from_secs(60),
        minimum_throughput: 1,
    };
    let breaker = CircuitBreakerPolicy::new(config);

    rt.block_on(async {
        let _ = breaker
            .execute(|| async { Err::<&str, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) })
            .await;
    });

    c.bench_function("circuit_breaker_rejected_while_open", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(breaker.execute(|| async { Ok::<_, std::io::Error>("ok") }).await);
        });
    });
}

criterion_group!(benches, circuit_breaker_throughput_success, circuit_breaker_throughput_open);
criterion_main!(benches);