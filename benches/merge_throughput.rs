//! Benchmarks for the refresh hot path
//!
//! This benchmark measures:
//! - Normalizing a raw listing
//! - Merging a fresh batch into a large enriched cache
//! - Snapshot validation of persisted bytes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use smart_cache::config::{RecordFilter, RetentionPolicy};
use smart_cache::merge::{merge, normalize_batch};
use smart_cache::store::validate_bytes;
use smart_cache::types::{CacheSnapshot, RawRecord, Record};

fn raw_batch(n: usize, name_suffix: &str) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            RawRecord::new(format!("{}", 10_000_000 + i))
                .with_name(format!("Activity {}{}", i, name_suffix))
                .with_kind(if i % 3 == 0 { "Run" } else { "Ride" })
                .with_occurred_at("2024-05-01T07:00:00Z")
                .with_magnitude(i as f64 * 1.5)
                .with_attribute("kudos", json!(i % 17))
        })
        .collect()
}

fn enriched_cache(n: usize) -> Vec<Record> {
    normalize_batch(raw_batch(n, ""), &RecordFilter::default())
        .records
        .into_iter()
        .map(|r| {
            r.with_enriched("polyline", json!("a~l~Fjk~uOwHJy@P"))
                .with_enriched("bounds", json!([37.1, -122.4, 37.2, -122.3]))
        })
        .collect()
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    for n in [200usize, 2_000, 20_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || raw_batch(n, ""),
                |raw| black_box(normalize_batch(raw, &RecordFilter::default())),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for n in [200usize, 2_000, 20_000] {
        let cached = enriched_cache(n);
        let fresh = normalize_batch(raw_batch(n, " (edited)"), &RecordFilter::default()).records;
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("drop", n), &n, |b, _| {
            b.iter_batched(
                || fresh.clone(),
                |fresh| black_box(merge(&cached, fresh, RetentionPolicy::Drop)),
                criterion::BatchSize::LargeInput,
            );
        });
        group.bench_with_input(BenchmarkId::new("idempotent", n), &n, |b, _| {
            b.iter_batched(
                || cached.clone(),
                |same| black_box(merge(&cached, same, RetentionPolicy::Retain)),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let snapshot = CacheSnapshot::new(chrono::Utc::now(), enriched_cache(2_000));
    let bytes = serde_json::to_vec(&snapshot).unwrap();

    let mut group = c.benchmark_group("validate");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("validate_bytes_2000", |b| {
        b.iter(|| black_box(validate_bytes(black_box(&bytes)).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_normalize, bench_merge, bench_validate);
criterion_main!(benches);
