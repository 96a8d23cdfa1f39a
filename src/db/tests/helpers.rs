use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::db::{Database, DbOptions, WriteOptions};
use crate::filenames::{self, FileKind};
use crate::vfs::fault::FaultFs;
use crate::vfs::{FileSystem, StdFs};

/// Initialize tracing controlled by `RUST_LOG`; only the first call
/// takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options sized so ordinary tests never trigger a flush.
pub fn default_options() -> DbOptions {
    init_tracing();
    DbOptions {
        write_buffer_size: 4 * 1024 * 1024,
        ..DbOptions::default()
    }
}

/// Small write buffer: memtables seal and flush after a few KiB.
pub fn small_buffer_options() -> DbOptions {
    init_tracing();
    DbOptions {
        write_buffer_size: 4096,
        ..DbOptions::default()
    }
}

/// Options routed through a shared fault-injection filesystem.
pub fn fault_options(fault: &FaultFs) -> DbOptions {
    init_tracing();
    DbOptions {
        fs: Arc::new(fault.clone()),
        ..default_options()
    }
}

/// A fault filesystem over the real one.
pub fn fault_fs() -> FaultFs {
    FaultFs::new(Arc::new(StdFs))
}

/// Open with default options.
pub fn open_db(path: &Path) -> Database {
    Database::open(path, default_options()).expect("open")
}

/// Reopen after a crash or close.
///
/// A dropped (crashed) instance may briefly keep the LOCK file alive
/// while a detached background worker finishes; retry through that.
pub fn reopen(path: &Path) -> Database {
    reopen_with(path, default_options())
}

/// [`reopen`] with explicit options.
pub fn reopen_with(path: &Path, opts: DbOptions) -> Database {
    for _ in 0..500 {
        match Database::open(path, opts.clone()) {
            Ok(db) => return db,
            Err(crate::db::DbError::AlreadyInUse(_)) => {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(err) => panic!("reopen failed: {err}"),
        }
    }
    panic!("reopen timed out waiting for the database lock");
}

/// `WriteOptions` shorthand.
pub fn synced() -> WriteOptions {
    WriteOptions::synced()
}

pub fn unsynced() -> WriteOptions {
    WriteOptions::default()
}

pub fn wal_disabled() -> WriteOptions {
    WriteOptions { sync: false, disable_wal: true }
}

/// Write `count` keyed puts (`<prefix>-NNNN` → `val-NNNN`).
pub fn fill(db: &Database, prefix: &str, count: usize, opts: &WriteOptions) {
    for i in 0..count {
        db.put(
            format!("{prefix}-{i:04}").as_bytes(),
            format!("val-{i:04}").as_bytes(),
            opts,
        )
        .expect("put");
    }
}

/// Assert all `count` keys written by [`fill`] read back.
pub fn verify_fill(db: &Database, prefix: &str, count: usize) {
    for i in 0..count {
        let key = format!("{prefix}-{i:04}");
        assert_eq!(
            db.get(key.as_bytes()).expect("get"),
            Some(format!("val-{i:04}").into_bytes()),
            "missing {key}"
        );
    }
}

/// Table file numbers present on disk.
pub fn tables_on_disk(path: &Path) -> Vec<u64> {
    let mut numbers = Vec::new();
    for entry in StdFs.list_dir(path).expect("list") {
        if let Some(name) = entry.file_name().and_then(|n| n.to_str()) {
            if let Some(FileKind::Table(number)) = filenames::parse_file_name(name) {
                numbers.push(number);
            }
        }
    }
    numbers.sort_unstable();
    numbers
}

/// WAL file numbers present on disk.
pub fn wals_on_disk(path: &Path) -> Vec<u64> {
    let mut numbers = Vec::new();
    for entry in StdFs.list_dir(path).expect("list") {
        if let Some(name) = entry.file_name().and_then(|n| n.to_str()) {
            if let Some(FileKind::WriteAheadLog(number)) = filenames::parse_file_name(name) {
                numbers.push(number);
            }
        }
    }
    numbers.sort_unstable();
    numbers
}

/// Live table numbers according to the installed version.
pub fn live_tables(db: &Database) -> Vec<u64> {
    let mut numbers: Vec<u64> = crate::db::lock_or_recover(&db.inner.versions)
        .live_files()
        .into_iter()
        .collect();
    numbers.sort_unstable();
    numbers
}

/// A temp dir + opened database.
pub fn fresh_db() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = open_db(dir.path());
    (dir, db)
}
