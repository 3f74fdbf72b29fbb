//! Microbenchmarks for the `insert()` hot path.
//!
//! Run with: `cargo bench -p rondo -- record`

#![allow(missing_docs, clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rondo::ingest::Submission;
use rondo::store::Store;
use tempfile::tempdir;

fn setup_store(series_count: u32) -> (Store, Vec<String>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("bench_store");
    let store = Store::init(&store_path, b"0123456789abcdef0123456789abcdef".to_vec()).unwrap();

    let series = (0..series_count).map(|i| format!("metric_{i}|id={i}")).collect();
    (store, series, temp_dir)
}

fn bench_insert_single(c: &mut Criterion) {
    let (mut store, series, _dir) = setup_store(1);
    let base_time = 1_700_000_000_000u64;
    let mut ts = base_time;

    c.bench_function("insert/single_series", |b| {
        b.iter(|| {
            ts += 1_000;
            store
                .insert(black_box(&Submission { series: series[0].clone(), ts, value: 42.5 }))
                .unwrap();
        });
    });
}

fn bench_insert_many_series(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert/series_count");

    for count in [1, 10, 30, 100] {
        let (mut store, series, _dir) = setup_store(count);
        let base_time = 1_700_000_000_000u64;
        let mut ts = base_time;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                ts += 1_000;
                for (i, s) in series.iter().enumerate() {
                    store
                        .insert(black_box(&Submission { series: s.clone(), ts, value: f64::from(i as u32) }))
                        .unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_insert_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_batch/series_count");

    for count in [1, 10, 30, 100] {
        let (mut store, series, _dir) = setup_store(count);
        let base_time = 1_700_000_000_000u64;
        let mut ts = base_time;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                ts += 1_000;
                let batch: Vec<_> = series
                    .iter()
                    .enumerate()
                    .map(|(i, s)| Submission { series: s.clone(), ts, value: f64::from(i as u32) })
                    .collect();
                store.insert_batch(black_box(&batch)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_insert_throughput(c: &mut Criterion) {
    let (mut store, series, _dir) = setup_store(30);
    let base_time = 1_700_000_000_000u64;
    let mut ts = base_time;

    c.bench_function("insert/30_series_throughput", |b| {
        b.iter(|| {
            ts += 1_000;
            for s in &series {
                store.insert(black_box(&Submission { series: s.clone(), ts, value: 99.9 })).unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_insert_single, bench_insert_many_series, bench_insert_batch, bench_insert_throughput);
criterion_main!(benches);
