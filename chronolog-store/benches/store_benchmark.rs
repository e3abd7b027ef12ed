use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use chronolog_store::{ManualClock, Record, SnapshotDir, Store, UserLog};
use criterion::{criterion_group, criterion_main, Criterion};

const NOW: i64 = 1_700_000_000;

fn filled_log(n: i64) -> UserLog {
    let mut log = UserLog::new();
    for ts in 0..n {
        log.insert_or_replace(ts * 2, "payload".to_string(), false);
    }
    log
}

fn bench_insert_append(c: &mut Criterion) {
    c.bench_function("userlog_insert_append_10k", |b| {
        b.iter(|| {
            let mut log = UserLog::new();
            for ts in 0..10_000 {
                log.insert_or_replace(black_box(ts), "x".to_string(), true);
            }
            black_box(log.len());
        })
    });
}

fn bench_upper_bound(c: &mut Criterion) {
    let log = filled_log(100_000);
    c.bench_function("userlog_upper_bound_100k", |b| {
        b.iter(|| black_box(log.upper_bound_index(black_box(123_457))))
    });
}

fn bench_range(c: &mut Criterion) {
    let log = filled_log(100_000);
    c.bench_function("userlog_range_100_of_100k", |b| {
        b.iter(|| black_box(log.range(black_box(50_000), black_box(50_198))))
    });
}

fn bench_all_latest(c: &mut Criterion) {
    let store = Store::ephemeral("bench", Duration::from_secs(3600));
    for uid in 0..1_000 {
        for ts in 0..20 {
            store.insert(&format!("user-{uid}"), ts, "payload").unwrap();
        }
    }
    c.bench_function("store_all_latest_1k_users", |b| {
        b.iter(|| black_box(store.all_latest(black_box(10)).len()))
    });
}

fn bench_flush(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Store::new(
        "bench",
        Duration::from_secs(3600),
        Some(SnapshotDir::new(dir.path())),
        clock.clone(),
    );

    let mut ts = 0;
    c.bench_function("store_flush_100_users", |b| {
        b.iter(|| {
            for uid in 0..100 {
                store.insert(&format!("user-{uid}"), ts, "payload").unwrap();
            }
            ts += 1;
            clock.advance(1);
            black_box(store.flush());
        })
    });
}

fn bench_record_encode(c: &mut Criterion) {
    let batch: Vec<Record> = (0..100).map(|ts| Record::new(ts, "payload")).collect();
    c.bench_function("fragment_encode_100", |b| {
        b.iter(|| black_box(serde_json::to_vec(black_box(&batch)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_insert_append,
    bench_upper_bound,
    bench_range,
    bench_all_latest,
    bench_flush,
    bench_record_encode,
);
criterion_main!(benches);
