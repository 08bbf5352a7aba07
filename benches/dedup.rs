//! Benchmarks for multi-backend de-duplication

use audit_trail::audit::{dedup_records, AuditRecord, LogLevel};
use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// `copies` backends each returning the same `n` records.
fn overlapping(n: usize, copies: usize) -> Vec<AuditRecord> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let page: Vec<AuditRecord> = (0..n)
        .map(|i| {
            AuditRecord::new("bench", "LOGIN", LogLevel::Info)
                .with_id(&format!("r{i}"))
                .with_timestamp(base + Duration::seconds(i as i64))
        })
        .collect();
    (0..copies).flat_map(|_| page.clone()).collect()
}

fn benchmark_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_records");
    for n in [100, 1_000, 10_000] {
        let records = overlapping(n, 3);
        group.bench_with_input(BenchmarkId::from_parameter(n), &records, |b, records| {
            b.iter(|| black_box(dedup_records(records.clone())))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_dedup);
criterion_main!(benches);
