//! Benchmarks for thread reconstruction and incremental merges.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pqpgp_threads::{
    build_tree, merge_record, BoardId, FilterConfig, FilterPolicy, KeywordRule,
    MemoryRecordStore, RebuildRequest, Record, ThreadTree, Window,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "pqpgp_threads=info".into()),
        )
        .try_init();
}

/// Generates a board of `size` records in reply chains, some with lost ancestors.
fn synthetic_board(size: usize) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut chains: Vec<Vec<String>> = Vec::with_capacity(size);
    let mut records = Vec::with_capacity(size);

    for i in 0..size {
        let chain = if i == 0 || rng.gen_bool(0.1) {
            Vec::new()
        } else {
            let parent = rng.gen_range(i.saturating_sub(50)..i);
            let mut chain = chains[parent].clone();
            chain.push(format!("r{}", parent));
            chain
        };
        chains.push(chain.clone());

        // Roughly one record in ten never arrived
        if rng.gen_bool(0.1) {
            continue;
        }
        let parents: Vec<&str> = chain.iter().map(String::as_str).collect();
        let mut record = Record::new("bench", format!("r{}", i), &parents);
        if rng.gen_bool(0.05) {
            record = record.with_body("casino");
        }
        records.push(record);
    }
    records
}

fn policy() -> FilterPolicy {
    FilterPolicy::new(FilterConfig {
        body: KeywordRule::new("casino; lottery"),
        ..Default::default()
    })
}

fn bench_full_build(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("full_build");
    let policy = policy();

    for size in [100usize, 1_000, 10_000] {
        let store = MemoryRecordStore::new();
        store.insert_all(synthetic_board(size));
        let request = RebuildRequest::new("bench", Window::default());

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("threaded", size), &size, |b, _| {
            b.iter(|| build_tree(black_box(&store), &policy, true, &request))
        });
        group.bench_with_input(BenchmarkId::new("flat", size), &size, |b, _| {
            b.iter(|| build_tree(black_box(&store), &policy, false, &request))
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    let policy = policy();

    for size in [100usize, 1_000] {
        let records = synthetic_board(size);
        group.throughput(Throughput::Elements(records.len() as u64));
        group.bench_with_input(BenchmarkId::new("sequential", size), &records, |b, records| {
            b.iter(|| {
                let mut tree = ThreadTree::new(BoardId::new("bench"));
                for record in records {
                    merge_record(&mut tree, black_box(record.clone()), &policy, true);
                }
                tree
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_full_build, bench_merge);
criterion_main!(benches);
