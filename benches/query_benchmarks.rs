//! Performance Benchmarks for the graph engine
//!
//! Measures parse cost, batch apply throughput, join traversal and snapshot
//! encoding over synthetic graphs.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use strand_core::*;

const USERS: usize = 500;
const GROUPS: usize = 50;

/// Users in groups; every group links to two channels.
fn membership_graph() -> GraphEngine {
    let mut batch = String::new();
    for g in 0..GROUPS {
        batch.push_str(&format!("add node key=group{}, kind=group;", g));
        batch.push_str(&format!("add node key=chan{}, kind=channel;", g));
        batch.push_str(&format!(
            "add unique edge fromKey=group{}, toKey=chan{}, edgeType=channel;",
            g, g
        ));
        batch.push_str(&format!(
            "add unique edge fromKey=group{}, toKey=chan{}, edgeType=channel;",
            g,
            (g + 1) % GROUPS
        ));
    }
    for u in 0..USERS {
        batch.push_str(&format!("add node key=user{}, kind=principal;", u));
        batch.push_str(&format!(
            "add unique edge fromKey=user{}, toKey=group{}, edgeType=member;",
            u,
            u % GROUPS
        ));
    }

    let mut engine = GraphEngine::new();
    engine.execute(&batch).expect("seed graph");
    engine
}

fn add_batch(size: usize) -> String {
    (0..size)
        .map(|i| format!("add node key=n{}, tags='seq={}'; ", i, i))
        .collect()
}

fn bench_parse(c: &mut Criterion) {
    let query = "select (key=user1) -> [edgeType=member] -> (kind=group) as groups -> [edgeType=channel] -> (*);";
    c.bench_function("parse/select_two_hops", |b| {
        b.iter(|| parse_commands(black_box(query)).unwrap())
    });

    let batch = add_batch(100);
    let mut group = c.benchmark_group("parse/add_batch");
    group.throughput(Throughput::Elements(100));
    group.bench_function("100_statements", |b| b.iter(|| parse_commands(black_box(&batch)).unwrap()));
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let batch = add_batch(100);
    let mut group = c.benchmark_group("execute/add_batch");
    group.throughput(Throughput::Elements(100));
    group.bench_function("100_nodes", |b| {
        b.iter_batched(
            GraphEngine::new,
            |mut engine| engine.execute(black_box(&batch)).unwrap(),
            BatchSize::SmallInput,
        )
    });
    group.finish();

    let mut engine = membership_graph();
    c.bench_function("execute/select_two_hops", |b| {
        b.iter(|| {
            engine
                .execute(black_box(
                    "select (key=user7) -> [edgeType=member] -> (*) -> [edgeType=channel] -> (*);",
                ))
                .unwrap()
        })
    });
    c.bench_function("execute/select_by_tag", |b| {
        b.iter(|| engine.execute(black_box("select (kind=group);")).unwrap())
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let engine = membership_graph();
    let factory = JsonSnapshotFactory::new();
    let bytes = factory.to_bytes(engine.map()).unwrap();

    c.bench_function("snapshot/encode", |b| b.iter(|| factory.to_bytes(black_box(engine.map())).unwrap()));
    c.bench_function("snapshot/decode", |b| {
        b.iter(|| factory.create_from_bytes(black_box(&bytes)).unwrap())
    });
}

criterion_group!(benches, bench_parse, bench_execute, bench_snapshot);
criterion_main!(benches);
