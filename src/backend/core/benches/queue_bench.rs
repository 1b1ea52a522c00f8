//! Benchmarks for backoff computation, payload validation and the in-memory store.
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use research_queue_core::jobs::{JobPriority, JobRecord, ResearchRequest, RetryPolicy};
use research_queue_core::store::{JobStore, MemoryStore};
use tokio::runtime::Runtime;

fn bench_retry_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");
    let policy = RetryPolicy::default();
    for attempt in [0_u32, 3, 10, 63] {
        group.bench_with_input(BenchmarkId::from_parameter(attempt), &attempt, |b, &a| {
            b.iter(|| black_box(policy.next_delay(black_box(a))));
        });
    }
    group.finish();
}

fn bench_payload_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_validation");
    let short = ResearchRequest::new("quantum computing trends")
        .with_output_format("markdown")
        .with_focus_area("technical");
    let long = ResearchRequest::new("research ".repeat(400));
    for (label, request) in [("short", &short), ("truncated", &long)] {
        group.bench_with_input(BenchmarkId::from_parameter(label), request, |b, r| {
            b.iter(|| black_box(r.validate(1000)));
        });
    }
    group.finish();
}

fn seeded_store(rt: &Runtime, jobs: usize) -> MemoryStore {
    let store = MemoryStore::new();
    rt.block_on(async {
        for i in 0..jobs {
            let payload = ResearchRequest::new(format!("query {}", i)).validate(1000).unwrap();
            let priority = JobPriority::DESCENDING[i % JobPriority::DESCENDING.len()];
            store.create(&JobRecord::new("bench", payload, priority, 3)).await.unwrap();
        }
    });
    store
}

fn bench_memory_list_eligible(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_list_eligible");
    let rt = Runtime::new().unwrap();
    for size in [100_usize, 1_000, 10_000] {
        let store = seeded_store(&rt, size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    store
                        .list_eligible(10, &JobPriority::DESCENDING, Utc::now())
                        .await
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_retry_backoff, bench_payload_validation, bench_memory_list_eligible);
criterion_main!(benches);
