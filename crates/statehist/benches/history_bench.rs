//! Benchmarks for state history building and querying.
//!
//! Run with: cargo bench --package statehist
//!
//! ## Benchmark Categories
//!
//! - **Build**: replaying a change stream into each backend
//! - **Point queries**: single-attribute lookups on a completed history
//! - **Full-state queries**: whole-namespace snapshots

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use statehist::{
    BackendKind, CancellationToken, HistoryBuilder, HistoryTreeConfig, PassthroughDecoder,
    StateChange, StateSystem, StateValue,
};
use std::sync::Arc;
use tempfile::TempDir;

const ATTRIBUTES: i64 = 32;

/// Round-robin changes over `ATTRIBUTES` attributes, one per time unit.
fn generate_changes(count: i64) -> Vec<StateChange> {
    (0..count)
        .map(|i| {
            let name = (i % ATTRIBUTES).to_string();
            StateChange::set(&["threads", name.as_str(), "state"], i, StateValue::Long(i / 7))
        })
        .collect()
}

fn build(backend: &BackendKind, changes: Vec<StateChange>) -> Arc<StateSystem> {
    let (ss, writer) = StateSystem::new("bench", 0, backend).unwrap();
    HistoryBuilder::new(PassthroughDecoder, writer, CancellationToken::new())
        .run(changes)
        .unwrap();
    ss
}

fn tree_backend(dir: &TempDir) -> BackendKind {
    BackendKind::HistoryTree {
        path: dir.path().join("bench.ht"),
        config: HistoryTreeConfig::default().with_block_size(4096),
    }
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");

    for size in [10_000i64, 100_000].iter() {
        let changes = generate_changes(*size);
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("in_memory", size), &changes, |b, changes| {
            b.iter(|| build(&BackendKind::InMemory, black_box(changes.clone())))
        });

        group.bench_with_input(BenchmarkId::new("history_tree", size), &changes, |b, changes| {
            let dir = TempDir::new().unwrap();
            let backend = tree_backend(&dir);
            b.iter(|| build(&backend, black_box(changes.clone())))
        });
    }

    group.finish();
}

fn bench_point_query(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let ss = build(&tree_backend(&dir), generate_changes(200_000));
    let quark = ss.get_quark_absolute(&["threads", "7", "state"]).unwrap();
    let end = ss.current_end_time();

    let mut t = 0;
    c.bench_function("history_tree_single_query", |b| {
        b.iter(|| {
            t = (t + 7919) % end;
            ss.query_single_state(black_box(t), quark).unwrap()
        })
    });
}

fn bench_full_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_query");
    let dir = TempDir::new().unwrap();
    let backends = [
        ("in_memory", BackendKind::InMemory),
        ("history_tree", tree_backend(&dir)),
    ];

    for (name, backend) in backends.iter() {
        let ss = build(backend, generate_changes(200_000));
        let end = ss.current_end_time();
        let mut t = 0;
        group.bench_function(*name, |b| {
            b.iter(|| {
                t = (t + 7919) % end;
                ss.query_full_state(black_box(t)).unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build, bench_point_query, bench_full_query);
criterion_main!(benches);
