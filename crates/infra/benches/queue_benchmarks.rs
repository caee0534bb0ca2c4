use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use sitefleet_infra::dispatch::InMemoryDispatchQueue;
use sitefleet_infra::jobs::{InMemoryJobStore, JobSpec, JobType};
use sitefleet_infra::JobQueue;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn accelerated() -> JobQueue<InMemoryJobStore> {
    JobQueue::accelerated(InMemoryJobStore::new(), Arc::new(InMemoryDispatchQueue::new()))
}

fn bench_enqueue_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_latency");

    group.bench_function("store_direct", |b| {
        let queue = JobQueue::store_direct(InMemoryJobStore::new());
        b.iter(|| {
            rt.block_on(queue.enqueue(black_box(JobSpec::new(JobType::GenerateDraft))))
                .unwrap()
        });
    });

    group.bench_function("accelerated", |b| {
        let queue = accelerated();
        b.iter(|| {
            rt.block_on(queue.enqueue(black_box(JobSpec::new(JobType::GenerateDraft))))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_dequeue_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dequeue_throughput");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));

        group.bench_with_input(
            BenchmarkId::new("accelerated", batch_size),
            batch_size,
            |b, &batch_size| {
                let queue = accelerated();
                b.iter(|| {
                    rt.block_on(async {
                        for _ in 0..batch_size {
                            queue.enqueue(JobSpec::new(JobType::Research)).await.unwrap();
                        }
                        black_box(queue.dequeue(batch_size).await.unwrap())
                    })
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("store_direct", batch_size),
            batch_size,
            |b, &batch_size| {
                let queue = JobQueue::store_direct(InMemoryJobStore::new());
                b.iter(|| {
                    rt.block_on(async {
                        for priority in 1..=batch_size {
                            let spec = JobSpec::new(JobType::Research).with_priority(priority as i16);
                            queue.enqueue(spec).await.unwrap();
                        }
                        black_box(queue.dequeue(batch_size).await.unwrap())
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue_latency, bench_dequeue_throughput);
criterion_main!(benches);
