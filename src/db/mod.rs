//! The database engine — write path, read path, lifecycle, and the
//! recovery/durability orchestrator.
//!
//! ## Design overview
//!
//! A [`Database`] owns one directory. Writes flow WAL-first through a
//! serialized write queue into the active memtable; when the memtable
//! crosses its size threshold it is sealed and a background worker
//! flushes it into a level-0 table, recording the new file through
//! [`VersionSet::log_and_apply`]. Reads consult the active memtable,
//! sealed memtables, and the current version's tables, newest first.
//!
//! ## Ordering guarantees
//!
//! - Writes are totally ordered by sequence number; a `sync=true` write
//!   that returns success is durable and its sequences exceed every
//!   previously acknowledged sync write.
//! - A reader sees exactly the records with sequence ≤ its snapshot.
//! - Iterators capture a snapshot and a version; later flushes and
//!   compactions never affect an existing iterator.
//!
//! ## Fatal latch
//!
//! An unrecoverable background error (corruption, recurring I/O failure)
//! latches the instance: subsequent writes and flushes fail with
//! [`DbError::Fatal`], reads keep working, and `close` completes without
//! further error. The latch lives on the instance only — reopening the
//! database clears it.

mod compaction;
mod flush;
mod iterator;
mod recovery;

#[cfg(test)]
mod tests;

pub use iterator::DbIterator;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchError, BatchOp, WriteBatch};
use crate::crashpoint::{kill_point, sync_point};
use crate::filenames;
use crate::keys::{SequenceNumber, ValueKind};
use crate::manifest::{FileMetaData, ManifestError, VersionSet};
use crate::memtable::Memtable;
use crate::sstable::{SstError, Table};
use crate::vfs::{FileLock, FileSystem, LockError, StdFs, WritableFile};
use crate::wal::{LogWriter, WalError};

// ------------------------------------------------------------------------------------------------
// Error taxonomy
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the public API.
///
/// Cloneable so that idempotent operations (notably `close`) can hand
/// the same result to repeated callers.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DbError {
    /// A requested artifact does not exist (non-fatal).
    #[error("not found")]
    NotFound,

    /// Checksum mismatch, malformed structure, or invariant violation.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Filesystem-level failure.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The caller supplied incoherent options or arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another process holds the database lock.
    #[error("database already in use: {0}")]
    AlreadyInUse(String),

    /// Operation on a closed handle.
    #[error("database is closed")]
    DbClosed,

    /// The instance-wide fatal latch is set; writes are rejected until
    /// the database is reopened.
    #[error("fatal background error: {0}")]
    Fatal(String),
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Convenience alias for public results.
pub type DbResult<T> = Result<T, DbError>;

impl From<WalError> for DbError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Io(io) => Self::Io(Arc::new(io)),
            WalError::Corruption { offset, reason } => {
                Self::Corruption(format!("log offset {offset}: {reason}"))
            }
        }
    }
}

impl From<SstError> for DbError {
    fn from(err: SstError) -> Self {
        match err {
            SstError::Io(io) => Self::Io(Arc::new(io)),
            SstError::Corruption(reason) => Self::Corruption(reason),
            SstError::Encoding(err) => Self::Corruption(err.to_string()),
            SstError::InvalidArgument(reason) => Self::InvalidArgument(reason),
        }
    }
}

impl From<ManifestError> for DbError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Io(io) => Self::Io(Arc::new(io)),
            ManifestError::Wal(wal) => wal.into(),
            ManifestError::Corruption(reason) => Self::Corruption(reason),
            ManifestError::Encoding(err) => Self::Corruption(err.to_string()),
            ManifestError::InvalidArgument(reason) => Self::InvalidArgument(reason),
        }
    }
}

impl From<BatchError> for DbError {
    fn from(err: BatchError) -> Self {
        Self::Corruption(err.to_string())
    }
}

impl From<LockError> for DbError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked => Self::AlreadyInUse("lock held".into()),
            LockError::Io(io) => Self::Io(Arc::new(io)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Event hooks consumed by the engine; all methods default to no-ops.
pub trait EventListener: Send + Sync {
    /// A background job hit an unrecoverable error; the fatal latch is
    /// about to be set.
    fn on_background_error(&self, _error: &DbError) {}

    /// A memtable flush installed table `file_number`.
    fn on_flush_completed(&self, _file_number: u64) {}
}

/// Options controlling an open database.
#[derive(Clone)]
pub struct DbOptions {
    /// Bootstrap an empty directory instead of failing `NotFound`.
    pub create_if_missing: bool,

    /// Fail if the database already exists.
    pub error_if_exists: bool,

    /// Treat recoverable oddities (e.g. unknown files) as errors.
    pub paranoid_checks: bool,

    /// Memtable size threshold before it is sealed and flushed.
    pub write_buffer_size: usize,

    /// Target payload size of a table data block.
    pub block_size: usize,

    /// Entries between restart points inside a block.
    pub block_restart_interval: usize,

    /// Number of levels in the tree.
    pub max_levels: usize,

    /// Sealed memtables allowed to queue before writers stall.
    pub max_immutable_memtables: usize,

    /// Route reads through the direct-I/O wrapper.
    pub use_direct_reads: bool,

    /// Serve random reads from memory maps.
    pub use_mmap_reads: bool,

    /// Background worker threads.
    pub background_workers: usize,

    /// The filesystem everything goes through.
    pub fs: Arc<dyn FileSystem>,

    /// Event hooks.
    pub listener: Option<Arc<dyn EventListener>>,
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_levels", &self.max_levels)
            .finish_non_exhaustive()
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            block_size: 4096,
            block_restart_interval: 16,
            max_levels: 7,
            max_immutable_memtables: 2,
            use_direct_reads: false,
            use_mmap_reads: true,
            background_workers: 2,
            fs: Arc::new(StdFs),
            listener: None,
        }
    }
}

impl DbOptions {
    /// Reject incoherent combinations.
    pub fn validate(&self) -> DbResult<()> {
        if self.use_direct_reads && self.use_mmap_reads {
            return Err(DbError::InvalidArgument(
                "use_direct_reads is incompatible with use_mmap_reads".into(),
            ));
        }
        if self.max_levels < 2 {
            return Err(DbError::InvalidArgument(
                "max_levels must be at least 2".into(),
            ));
        }
        if self.write_buffer_size < 1024 {
            return Err(DbError::InvalidArgument(
                "write_buffer_size below 1 KiB".into(),
            ));
        }
        Ok(())
    }
}

/// Per-write durability knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging.
    pub sync: bool,

    /// Skip the WAL entirely; the write lives only in the memtable until
    /// the next flush.
    pub disable_wal: bool,
}

impl WriteOptions {
    /// `sync=true` — durable on return.
    pub fn synced() -> Self {
        Self { sync: true, disable_wal: false }
    }
}

/// Per-read knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Read at this sequence instead of the latest visible state.
    pub snapshot: Option<SequenceNumber>,
}

/// Point-in-time statistics from [`Database::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    /// `(file count, total bytes)` per level.
    pub levels: Vec<(usize, u64)>,
    /// Approximate bytes in the active memtable.
    pub memtable_bytes: usize,
    /// Sealed memtables awaiting flush.
    pub immutable_count: usize,
    /// Highest sequence number assigned.
    pub last_sequence: SequenceNumber,
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

/// A sealed memtable waiting for flush, tagged with its WAL.
#[derive(Clone)]
pub(crate) struct ImmutableMem {
    pub(crate) mem: Arc<Memtable>,
    pub(crate) wal_number: u64,
}

/// Memtable stack: one active table plus sealed tables, oldest first.
pub(crate) struct MemState {
    pub(crate) active: Arc<Memtable>,
    pub(crate) active_wal_number: u64,
    pub(crate) immutables: Vec<ImmutableMem>,
}

enum Job {
    Flush,
}

struct Background {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

/// A table file dropped from the version but possibly pinned by an
/// iterator holding the old version.
struct PendingFile {
    file_number: u64,
    meta: Arc<FileMetaData>,
}

pub(crate) struct DbInner {
    pub(crate) opts: DbOptions,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) path: PathBuf,

    /// Serializes `log_and_apply` and file-number allocation.
    pub(crate) versions: Mutex<VersionSet>,

    /// Memtable stack; the write path takes the write lock only to swap
    /// tables.
    pub(crate) state: RwLock<MemState>,

    /// Active WAL writer.
    pub(crate) wal: Mutex<Option<LogWriter>>,

    /// Write-queue leadership: the holder assigns sequences, appends to
    /// the WAL, and inserts into the memtable.
    write_queue: Mutex<()>,

    /// Next sequence to assign.
    next_sequence: AtomicU64,

    /// Highest sequence visible to readers.
    visible_sequence: AtomicU64,

    /// Open table readers, keyed by file number.
    tables: Mutex<HashMap<u64, Arc<Table>>>,

    /// Files awaiting deletion once no iterator can reference them.
    pending_files: Mutex<Vec<PendingFile>>,

    /// Serializes flush jobs (background worker vs. foreground `flush`).
    pub(crate) flush_lock: Mutex<()>,

    /// Signalled when a flush removes a sealed memtable.
    flush_done: Condvar,

    fatal: Mutex<Option<String>>,
    fatal_set: AtomicBool,
    closed: AtomicBool,
    /// Result of the first `close`; replayed to repeated callers.
    close_result: Mutex<Option<DbResult<()>>>,
    open_iterators: AtomicUsize,
    lock: Mutex<Option<Box<dyn FileLock>>>,
    background: Background,
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// Handle to an open database; clone freely across threads.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database at `path`.
    ///
    /// See the module documentation and [`recovery`] for the exact open
    /// algorithm: lock, CURRENT, manifest recovery, orphan cleanup, WAL
    /// replay, recovery flush, fresh WAL, background workers.
    pub fn open(path: impl AsRef<Path>, opts: DbOptions) -> DbResult<Self> {
        let inner = recovery::open_database(path.as_ref(), opts)?;
        let db = Self { inner };
        db.start_workers();
        Ok(db)
    }

    fn start_workers(&self) {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
        let mut handles = Vec::with_capacity(self.inner.opts.background_workers.max(1));
        for worker in 0..self.inner.opts.background_workers.max(1) {
            let receiver = receiver.clone();
            let weak = Arc::downgrade(&self.inner);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("rockyard-bg-{worker}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            let Some(inner) = weak.upgrade() else { break };
                            match job {
                                Job::Flush => {
                                    if inner.closed.load(Ordering::Acquire) {
                                        continue;
                                    }
                                    if let Err(err) = flush::flush_one(&inner) {
                                        inner.report_background_error(err);
                                    }
                                }
                            }
                        }
                    })
                    .expect("spawn background worker"),
            );
        }
        *lock_or_recover(&self.inner.background.sender) = Some(sender);
        *lock_or_recover(&self.inner.background.handles) = handles;
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    /// Insert or overwrite one key.
    pub fn put(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, opts)
    }

    /// Point-delete one key.
    pub fn delete(&self, key: &[u8], opts: &WriteOptions) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, opts)
    }

    /// Delete every key in `[start, end)`.
    pub fn delete_range(&self, start: &[u8], end: &[u8], opts: &WriteOptions) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range(start, end);
        self.write(batch, opts)
    }

    /// Apply a batch atomically.
    ///
    /// On `sync=true`, success means every record of the batch is
    /// durable; after a crash either all records are present or none.
    pub fn write(&self, mut batch: WriteBatch, opts: &WriteOptions) -> DbResult<()> {
        let inner = &self.inner;
        inner.check_open()?;
        inner.check_fatal()?;
        if batch.is_empty() {
            return Ok(());
        }

        // Queue leadership: everything below runs single-writer.
        let _leader = lock_or_recover(&inner.write_queue);
        inner.make_room_for_write()?;

        let base = inner.next_sequence.load(Ordering::Acquire);
        batch.set_sequence(base);
        let count = u64::from(batch.count());

        if !opts.disable_wal {
            let mut wal_guard = lock_or_recover(&inner.wal);
            let writer = wal_guard.as_mut().ok_or(DbError::DbClosed)?;
            kill_point("WAL.Append:0");
            writer.add_record(batch.encoded())?;
            if opts.sync {
                kill_point("WAL.Sync:0");
                writer.sync()?;
                kill_point("WAL.Sync:1");
            } else {
                writer.flush()?;
            }
        }

        sync_point("DBImpl::Write:BeforeMemtable");
        let mem = {
            let state = lock_or_recover_read(&inner.state);
            Arc::clone(&state.active)
        };
        apply_batch(&batch, &mem)?;

        inner.next_sequence.store(base + count, Ordering::Release);
        inner
            .visible_sequence
            .store(base + count - 1, Ordering::Release);
        Ok(())
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    /// Look up `key` at the latest visible state.
    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.get_with(&ReadOptions::default(), key)
    }

    /// Look up `key` with explicit read options.
    pub fn get_with(&self, opts: &ReadOptions, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let inner = &self.inner;
        inner.check_open()?;
        let snapshot = opts
            .snapshot
            .unwrap_or_else(|| inner.visible_sequence.load(Ordering::Acquire));

        // Newest data first: active memtable, sealed memtables, tables.
        let (active, immutables) = {
            let state = lock_or_recover_read(&inner.state);
            (Arc::clone(&state.active), state.immutables.clone())
        };

        let mut best_point: Option<(SequenceNumber, ValueKind, Vec<u8>)> = None;
        let mut best_tombstone: Option<SequenceNumber> = None;

        let mut merge_point = |candidate: Option<(SequenceNumber, ValueKind, Vec<u8>)>| {
            if let Some((seq, kind, value)) = candidate {
                if best_point.as_ref().is_none_or(|(best, _, _)| seq > *best) {
                    best_point = Some((seq, kind, value));
                }
            }
        };

        merge_point(active.get_point(key, snapshot));
        best_tombstone = max_opt(best_tombstone, active.max_covering_tombstone(key, snapshot));
        for immutable in immutables.iter().rev() {
            merge_point(immutable.mem.get_point(key, snapshot));
            best_tombstone = max_opt(
                best_tombstone,
                immutable.mem.max_covering_tombstone(key, snapshot),
            );
        }

        let version = lock_or_recover(&inner.versions).current();
        for level in 0..version.num_levels() {
            for meta in version.overlapping_files(level, Some(key), Some(key)) {
                let table = inner.table(&meta)?;
                if let Some(hit) = table.get(key, snapshot)? {
                    merge_point(Some((hit.sequence, hit.kind, hit.value)));
                }
                best_tombstone =
                    max_opt(best_tombstone, table.max_covering_tombstone(key, snapshot));
            }
        }

        Ok(resolve_visibility(best_point, best_tombstone))
    }

    /// An iterator over all live keys at a snapshot of the current state.
    pub fn new_iterator(&self, opts: &ReadOptions) -> DbResult<DbIterator> {
        self.inner.check_open()?;
        iterator::new_iterator(&self.inner, opts)
    }

    /// Highest sequence number visible to readers; usable as an explicit
    /// snapshot in [`ReadOptions`].
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.inner.visible_sequence.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------

    /// Seal the active memtable (if non-empty) and flush every sealed
    /// memtable to tables. On return, all previously enqueued writes are
    /// durable regardless of any later crash.
    pub fn flush(&self) -> DbResult<()> {
        let inner = &self.inner;
        inner.check_open()?;
        inner.check_fatal()?;
        {
            let _leader = lock_or_recover(&inner.write_queue);
            inner.seal_active_memtable(false)?;
        }
        while {
            let state = lock_or_recover_read(&inner.state);
            !state.immutables.is_empty()
        } {
            flush::flush_one(inner)?;
        }
        Ok(())
    }

    /// Merge the tables overlapping `[start, end]` from levels 0 and 1
    /// into level 1. Mechanism only; *when* to compact is the caller's
    /// policy.
    pub fn compact_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> DbResult<()> {
        self.inner.check_open()?;
        self.inner.check_fatal()?;
        compaction::compact_range(&self.inner, start, end)
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> DbResult<DbStats> {
        let inner = &self.inner;
        inner.check_open()?;
        let version = lock_or_recover(&inner.versions).current();
        let levels = (0..version.num_levels())
            .map(|level| {
                let files = version.files(level);
                (files.len(), files.iter().map(|f| f.file_size).sum())
            })
            .collect();
        let state = lock_or_recover_read(&inner.state);
        Ok(DbStats {
            levels,
            memtable_bytes: state.active.approximate_memory_usage(),
            immutable_count: state.immutables.len(),
            last_sequence: inner.visible_sequence.load(Ordering::Acquire),
        })
    }

    /// Flush, quiesce background work, sync and close every open file,
    /// and release the lock. Idempotent; requires all iterators to be
    /// closed first.
    pub fn close(&self) -> DbResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            // Idempotent: repeat callers get the first close's result.
            loop {
                if let Some(result) = lock_or_recover(&inner.close_result).clone() {
                    return result;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        info!(path = %inner.path.display(), "closing database");

        // Wait for outstanding iterators (enforced: they must be closed
        // before close returns).
        let mut waited = 0u64;
        while inner.open_iterators.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
            if waited % 5000 == 0 {
                warn!(
                    outstanding = inner.open_iterators.load(Ordering::Acquire),
                    "close is waiting on open iterators"
                );
            }
        }

        // Quiesce background work.
        if let Some(sender) = lock_or_recover(&inner.background.sender).take() {
            drop(sender);
        }
        let handles = std::mem::take(&mut *lock_or_recover(&inner.background.handles));
        for handle in handles {
            let _ = handle.join();
        }

        // Flush remaining memtables unless the instance is poisoned.
        let mut result = Ok(());
        if !inner.fatal_set.load(Ordering::Acquire) {
            let flush_result = (|| -> DbResult<()> {
                inner.seal_active_memtable(false)?;
                while {
                    let state = lock_or_recover_read(&inner.state);
                    !state.immutables.is_empty()
                } {
                    flush::flush_one(inner)?;
                }
                Ok(())
            })();
            if let Err(err) = flush_result {
                error!(error = %err, "flush during close failed");
                result = Err(err);
            }
        }

        // Sync and close the WAL and the manifest.
        if let Some(mut writer) = lock_or_recover(&inner.wal).take() {
            let _ = writer.sync();
            let _ = writer.close();
        }
        if let Err(err) = lock_or_recover(&inner.versions).close() {
            // A latched instance closes without surfacing further
            // errors; the next open gets a fresh chance.
            if result.is_ok() && !inner.fatal_set.load(Ordering::Acquire) {
                result = Err(err.into());
            }
        }

        // Final sweep of files no longer referenced.
        inner.remove_obsolete_files();

        // Release the lock last.
        if let Some(mut lock) = lock_or_recover(&inner.lock).take() {
            let _ = lock.release();
        }
        info!(path = %inner.path.display(), "database closed");
        *lock_or_recover(&inner.close_result) = Some(result.clone());
        result
    }
}

// ------------------------------------------------------------------------------------------------
// DbInner
// ------------------------------------------------------------------------------------------------

impl DbInner {
    pub(crate) fn check_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DbError::DbClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_fatal(&self) -> DbResult<()> {
        if self.fatal_set.load(Ordering::Acquire) {
            let message = lock_or_recover(&self.fatal)
                .clone()
                .unwrap_or_else(|| "unknown".into());
            Err(DbError::Fatal(message))
        } else {
            Ok(())
        }
    }

    /// Latch the fatal state and notify the listener.
    pub(crate) fn report_background_error(&self, err: DbError) {
        error!(error = %err, "background error; latching fatal state");
        if let Some(listener) = &self.opts.listener {
            listener.on_background_error(&err);
        }
        *lock_or_recover(&self.fatal) = Some(err.to_string());
        self.fatal_set.store(true, Ordering::Release);
        // Unblock writers stalled on the memtable-full condition.
        self.flush_done.notify_all();
    }

    /// Open (or fetch the cached) reader for a table file.
    pub(crate) fn table(&self, meta: &FileMetaData) -> DbResult<Arc<Table>> {
        {
            let tables = lock_or_recover(&self.tables);
            if let Some(table) = tables.get(&meta.file_number) {
                return Ok(Arc::clone(table));
            }
        }
        let path = filenames::table_file_name(&self.path, meta.file_number);
        let mut file = self.fs.open_random(&path)?;
        if self.opts.use_direct_reads {
            file = crate::vfs::direct::aligned_reader(
                file,
                crate::vfs::direct::DEFAULT_BLOCK_SIZE,
            );
        }
        let table = Arc::new(Table::open(file, meta.file_size)?);
        lock_or_recover(&self.tables)
            .entry(meta.file_number)
            .or_insert_with(|| Arc::clone(&table));
        Ok(table)
    }

    /// Seal the active memtable into the immutable stack and install a
    /// fresh memtable + WAL. `only_if_full` restricts sealing to the
    /// size-threshold path.
    ///
    /// Caller must hold write-queue leadership.
    pub(crate) fn seal_active_memtable(&self, only_if_full: bool) -> DbResult<()> {
        {
            let state = lock_or_recover_read(&self.state);
            if state.active.is_empty() {
                return Ok(());
            }
            if only_if_full
                && state.active.approximate_memory_usage() < self.opts.write_buffer_size
            {
                return Ok(());
            }
        }

        // New WAL first: the sealed memtable keeps its WAL until its
        // contents are durably in a table.
        let new_wal_number = lock_or_recover(&self.versions).new_file_number();
        let wal_path = filenames::log_file_name(&self.path, new_wal_number);
        let file = self.fs.create(&wal_path)?;
        let new_writer = LogWriter::new(file);

        {
            let mut wal_guard = lock_or_recover(&self.wal);
            if let Some(old) = wal_guard.as_mut() {
                old.flush()?;
                old.close()?;
            }
            *wal_guard = Some(new_writer);
        }

        let mut state = lock_or_recover_write(&self.state);
        let old_wal_number = state.active_wal_number;
        let sealed = std::mem::replace(&mut state.active, Arc::new(Memtable::new()));
        state.active_wal_number = new_wal_number;
        state.immutables.push(ImmutableMem {
            mem: sealed,
            wal_number: old_wal_number,
        });
        debug!(
            sealed_wal = old_wal_number,
            new_wal = new_wal_number,
            queued = state.immutables.len(),
            "memtable sealed"
        );
        Ok(())
    }

    /// Stall until the immutable queue has room, sealing the active
    /// memtable when it crosses the size threshold.
    fn make_room_for_write(&self) -> DbResult<()> {
        loop {
            let needs_seal = {
                let state = lock_or_recover_read(&self.state);
                if state.immutables.len() >= self.opts.max_immutable_memtables {
                    None
                } else {
                    Some(
                        state.active.approximate_memory_usage() >= self.opts.write_buffer_size,
                    )
                }
            };
            match needs_seal {
                Some(false) => return Ok(()),
                Some(true) => {
                    self.seal_active_memtable(true)?;
                    self.schedule_flush();
                }
                None => {
                    // Writers block briefly on the memtable-full
                    // condition until a flush creates capacity.
                    self.check_fatal()?;
                    self.check_open()?;
                    self.schedule_flush();
                    let guard = lock_or_recover(&self.flush_lock);
                    let (_guard, timeout) = self
                        .flush_done
                        .wait_timeout(guard, Duration::from_millis(100))
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    drop(timeout);
                }
            }
        }
    }

    pub(crate) fn schedule_flush(&self) {
        if let Some(sender) = lock_or_recover(&self.background.sender).as_ref() {
            let _ = sender.send(Job::Flush);
        }
    }

    pub(crate) fn notify_flush_done(&self) {
        self.flush_done.notify_all();
    }

    /// Move dropped files to the pending list and delete whatever is no
    /// longer pinned by any iterator.
    pub(crate) fn retire_files(&self, dropped: Vec<Arc<FileMetaData>>) {
        if !dropped.is_empty() {
            let mut pending = lock_or_recover(&self.pending_files);
            for meta in dropped {
                pending.push(PendingFile {
                    file_number: meta.file_number,
                    meta,
                });
            }
        }
        self.remove_obsolete_files();
    }

    /// Delete obsolete WALs and any retired table file whose metadata is
    /// no longer referenced outside the pending list.
    pub(crate) fn remove_obsolete_files(&self) {
        let log_number = {
            let versions = lock_or_recover(&self.versions);
            versions.log_number()
        };

        // Stale WALs: everything below the recorded log number.
        if let Ok(entries) = self.fs.list_dir(&self.path) {
            for entry in entries {
                let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some(filenames::FileKind::WriteAheadLog(number)) =
                    filenames::parse_file_name(name)
                {
                    if number < log_number {
                        if self.fs.remove(&entry).is_ok() {
                            debug!(wal = number, "removed obsolete WAL");
                        }
                    }
                }
            }
        }

        // Retired tables: delete once only the pending list holds them.
        let mut pending = lock_or_recover(&self.pending_files);
        let mut keep = Vec::new();
        for file in pending.drain(..) {
            if Arc::strong_count(&file.meta) > 1 {
                keep.push(file);
                continue;
            }
            lock_or_recover(&self.tables).remove(&file.file_number);
            let path = filenames::table_file_name(&self.path, file.file_number);
            match self.fs.remove(&path) {
                Ok(()) => debug!(file = file.file_number, "removed obsolete table"),
                Err(err) => {
                    warn!(file = file.file_number, error = %err, "obsolete table removal failed");
                    keep.push(file);
                }
            }
        }
        *pending = keep;
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        // Dropping without close simulates a crash: no flush, no sync.
        // Only detach the worker channel so threads can exit.
        if let Ok(mut sender) = self.background.sender.lock() {
            sender.take();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared helpers
// ------------------------------------------------------------------------------------------------

/// Apply a stamped batch to the memtable, assigning consecutive
/// sequences to its records.
pub(crate) fn apply_batch(batch: &WriteBatch, mem: &Memtable) -> DbResult<()> {
    let mut sequence = batch.sequence();
    for op in batch.ops()? {
        match op {
            BatchOp::Put { key, value } => {
                mem.add(sequence, ValueKind::Value, &key, &value);
            }
            BatchOp::Delete { key } => {
                mem.add(sequence, ValueKind::Deletion, &key, b"");
            }
            BatchOp::DeleteRange { start, end } => {
                mem.add_range_tombstone(&start, &end, sequence);
            }
        }
        sequence += 1;
    }
    Ok(())
}

/// Combine a point record and the strongest covering tombstone into the
/// user-visible result.
pub(crate) fn resolve_visibility(
    point: Option<(SequenceNumber, ValueKind, Vec<u8>)>,
    tombstone: Option<SequenceNumber>,
) -> Option<Vec<u8>> {
    match point {
        None => None,
        Some((seq, kind, value)) => {
            if tombstone.is_some_and(|t| t > seq) {
                return None;
            }
            match kind {
                ValueKind::Value => Some(value),
                _ => None,
            }
        }
    }
}

pub(crate) fn max_opt(
    a: Option<SequenceNumber>,
    b: Option<SequenceNumber>,
) -> Option<SequenceNumber> {
    a.max(b)
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn lock_or_recover_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn lock_or_recover_write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Used by the submodules when constructing a writable WAL file handle in
// one expression.
pub(crate) fn create_log_writer(
    fs: &Arc<dyn FileSystem>,
    path: &Path,
) -> DbResult<LogWriter> {
    let file: Box<dyn WritableFile> = fs.create(path)?;
    Ok(LogWriter::new(file))
}
