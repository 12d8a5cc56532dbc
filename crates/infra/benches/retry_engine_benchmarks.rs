use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use courier_core::{DeviceTarget, ManualClock, MessageId};
use courier_infra::cache::InMemoryCache;
use courier_infra::store::InMemoryRetryStore;
use courier_infra::{RetryConfig, RetryManager, RetryRequest};
use courier_transport::InMemoryPublisher;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

fn engine(clock: &ManualClock) -> RetryManager {
    RetryManager::new(
        RetryConfig {
            max_batch_size: 10_000,
            lock_wait: Duration::ZERO,
            ..RetryConfig::default()
        },
        InMemoryRetryStore::arc(),
        Arc::new(InMemoryCache::new(Arc::new(clock.clone()))),
        Arc::new(InMemoryPublisher::new()),
        Arc::new(clock.clone()),
    )
}

fn request(n: usize) -> RetryRequest {
    RetryRequest::new(
        MessageId::parse(format!("bench-{n}")).expect("valid id"),
        DeviceTarget::new(n as i64, "AA:BB:CC:DD", "SN-BENCH"),
        1003,
        r#"{"OptCode":1003,"Data":{"State":"OPEN"}}"#,
    )
}

/// Submission latency: ledger insert, payload cache, enqueue, attempt 0.
fn bench_submit(c: &mut Criterion) {
    let rt = runtime();
    let clock = ManualClock::default();
    let manager = engine(&clock);
    let mut n = 0usize;

    c.bench_function("submit", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(manager.submit(black_box(request(n))))
                .expect("submit failed")
        })
    });
}

/// One scan over a queue where every entry is due.
fn bench_scan(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("scan_due_batch");

    for size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let clock = ManualClock::default();
                    let manager = engine(&clock);
                    rt.block_on(async {
                        for n in 0..size {
                            manager.submit(request(n)).await.expect("submit failed");
                        }
                    });
                    clock.advance_millis(1000);
                    manager
                },
                |manager| {
                    let report = rt.block_on(manager.trigger_scan());
                    assert_eq!(report.retried, size);
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_submit, bench_scan);
criterion_main!(benches);
