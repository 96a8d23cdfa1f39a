//! Micro-benchmarks: raw put/get/flush paths over a temp directory.

use criterion::{Criterion, criterion_group, criterion_main};
use rockyardkv::db::{Database, DbOptions, WriteOptions};
use tempfile::TempDir;

fn bench_put_unsynced(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), DbOptions::default()).unwrap();
    let opts = WriteOptions::default();
    let mut i = 0u64;

    c.bench_function("put_unsynced_100b", |b| {
        b.iter(|| {
            let key = format!("key-{i:016}");
            db.put(key.as_bytes(), &[0u8; 100], &opts).unwrap();
            i += 1;
        })
    });
    db.close().unwrap();
}

fn bench_put_synced(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), DbOptions::default()).unwrap();
    let opts = WriteOptions::synced();
    let mut i = 0u64;

    c.bench_function("put_synced_100b", |b| {
        b.iter(|| {
            let key = format!("key-{i:016}");
            db.put(key.as_bytes(), &[0u8; 100], &opts).unwrap();
            i += 1;
        })
    });
    db.close().unwrap();
}

fn bench_get_memtable(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), DbOptions::default()).unwrap();
    for i in 0..10_000u64 {
        db.put(
            format!("key-{i:016}").as_bytes(),
            &[0u8; 100],
            &WriteOptions::default(),
        )
        .unwrap();
    }

    let mut i = 0u64;
    c.bench_function("get_memtable_hit", |b| {
        b.iter(|| {
            let key = format!("key-{:016}", i % 10_000);
            assert!(db.get(key.as_bytes()).unwrap().is_some());
            i += 1;
        })
    });
    db.close().unwrap();
}

fn bench_get_table(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), DbOptions::default()).unwrap();
    for i in 0..10_000u64 {
        db.put(
            format!("key-{i:016}").as_bytes(),
            &[0u8; 100],
            &WriteOptions::default(),
        )
        .unwrap();
    }
    db.flush().unwrap();

    let mut i = 0u64;
    c.bench_function("get_table_hit", |b| {
        b.iter(|| {
            let key = format!("key-{:016}", i % 10_000);
            assert!(db.get(key.as_bytes()).unwrap().is_some());
            i += 1;
        })
    });
    db.close().unwrap();
}

criterion_group!(
    benches,
    bench_put_unsynced,
    bench_put_synced,
    bench_get_memtable,
    bench_get_table
);
criterion_main!(benches);
