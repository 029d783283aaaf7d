//! Priority queue benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use driftsync_queue::{OperationKind, OperationPayload, Priority, PriorityQueue, QueueConfig, QueueItem, RetryConfig};
use std::time::{Duration, Instant};

fn item(n: usize, records: usize) -> QueueItem {
    QueueItem::new("items", format!("r{}", n % records), OperationKind::Delete, OperationPayload::Empty)
        .with_priority(Priority::ALL[n % Priority::ALL.len()])
}

/// Benchmark enqueueing into an empty queue.
fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    for count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let queue = PriorityQueue::new(QueueConfig::default());
                for n in 0..count {
                    queue.enqueue(item(n, count)).unwrap();
                }
                black_box(queue.len());
            });
        });
    }
    group.finish();
}

/// Benchmark a full enqueue, dequeue and complete cycle.
///
/// Fewer records than items means most dequeues skip items blocked
/// behind an earlier operation on the same record.
fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    for records in [1_000usize, 50] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::new("records", records), &records, |b, &records| {
            b.iter(|| {
                let queue = PriorityQueue::new(QueueConfig::default());
                for n in 0..1_000 {
                    queue.enqueue(item(n, records)).unwrap();
                }
                let mut done = 0;
                while done < 1_000 {
                    let mut admitted = Vec::new();
                    while let Some(item) = queue.dequeue(Instant::now()) {
                        admitted.push(item.id);
                    }
                    for id in admitted {
                        queue.complete(id).unwrap();
                        done += 1;
                    }
                }
                black_box(done);
            });
        });
    }
    group.finish();
}

/// Benchmark failure handling with immediate retries.
fn bench_retry(c: &mut Criterion) {
    let config = QueueConfig::default().with_retry(
        RetryConfig::new(3)
            .with_base_delay(Duration::ZERO)
            .with_jitter_ratio(0.0),
    );
    c.bench_function("fail_and_retry", |b| {
        b.iter(|| {
            let queue = PriorityQueue::new(config.clone());
            for n in 0..100 {
                queue.enqueue(item(n, 100)).unwrap();
            }
            let now = Instant::now();
            while let Some(item) = queue.dequeue(now) {
                if item.attempts == 0 {
                    queue.fail(item.id, "bench", now).unwrap();
                } else {
                    queue.complete(item.id).unwrap();
                }
            }
            black_box(queue.len());
        });
    });
}

criterion_group!(benches, bench_enqueue, bench_drain, bench_retry);

criterion_main!(benches);
