//! Open-time recovery — reconstructing a consistent database from
//! whatever a crash left behind.
//!
//! ## Open algorithm
//!
//! 1. Take the `LOCK` file (advisory exclusive); failure is
//!    `AlreadyInUse`.
//! 2. If `CURRENT` is absent: bootstrap when `create_if_missing`,
//!    otherwise fail `NotFound`. If present and `error_if_exists`: fail.
//! 3. `VersionSet::recover` — validate CURRENT, replay the manifest,
//!    cross-check live tables.
//! 4. Sweep the directory: delete every `<n>.sst` the recovered version
//!    does not reference (the orphaned-table cleanup that prevents
//!    sequence reuse), stale manifests, and `CURRENT.tmp` leftovers.
//! 5. Replay every WAL with `file_number ≥ log_number` in order into a
//!    fresh memtable, trusting each batch's embedded sequence. Tail
//!    truncation ends a log quietly; corruption of the durable prefix is
//!    fatal.
//! 6. If the replayed memtable holds data, flush it to a table (the
//!    standard flush protocol) so no WAL is needed to re-derive state.
//! 7. Open a fresh WAL and record its number through `log_and_apply`.
//! 8. Arm the sequence counters:
//!    `next = max(manifest last_sequence, max replayed sequence) + 1`.
//!
//! The caller starts background workers afterwards.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::batch::WriteBatch;
use crate::filenames::{self, FileKind};
use crate::manifest::{VersionEdit, VersionSet};
use crate::memtable::Memtable;
use crate::vfs::read_file_to_vec;
use crate::wal::{EndOfLog, LogReader};

use super::flush;
use super::{
    Background, DbError, DbInner, DbOptions, DbResult, ImmutableMem, MemState, apply_batch,
    create_log_writer, lock_or_recover,
};

/// Execute the open algorithm; returns a fully recovered inner handle
/// (workers not yet started).
pub(crate) fn open_database(path: &Path, opts: DbOptions) -> DbResult<Arc<DbInner>> {
    opts.validate()?;
    let fs = Arc::clone(&opts.fs);
    fs.mkdir_all(path)?;

    // 1. Lock out other processes.
    let lock = fs.lock(&filenames::lock_file_name(path))?;

    // 2–3. Find or create the canonical version.
    let mut versions = VersionSet::new(Arc::clone(&fs), path, opts.max_levels);
    let current_path = filenames::current_file_name(path);
    if fs.exists(&current_path) {
        if opts.error_if_exists {
            return Err(DbError::InvalidArgument(format!(
                "database already exists at {}",
                path.display()
            )));
        }
        versions.recover()?;
    } else {
        if !opts.create_if_missing {
            return Err(DbError::NotFound);
        }
        info!(path = %path.display(), "bootstrapping empty database");
        versions.bootstrap()?;
    }

    // 4. Directory sweep.
    let wal_numbers = sweep_directory(&fs, path, &versions, opts.paranoid_checks)?;

    // 5. WAL replay.
    let replayed = Memtable::new();
    let mut max_replayed_seq = versions.last_sequence();
    for number in &wal_numbers {
        let replay_seq = replay_wal(&fs, path, *number, &replayed)?;
        max_replayed_seq = max_replayed_seq.max(replay_seq);
    }

    // 7 (first half). A fresh WAL for the new session.
    let new_wal_number = versions.new_file_number();
    let wal_writer = create_log_writer(&fs, &filenames::log_file_name(path, new_wal_number))?;

    let replay_nonempty = !replayed.is_empty();
    let state = MemState {
        active: Arc::new(Memtable::new()),
        active_wal_number: new_wal_number,
        immutables: if replay_nonempty {
            vec![ImmutableMem {
                mem: Arc::new(replayed),
                wal_number: wal_numbers.last().copied().unwrap_or(0),
            }]
        } else {
            Vec::new()
        },
    };

    let inner = Arc::new(DbInner {
        fs: Arc::clone(&fs),
        path: path.to_path_buf(),
        versions: Mutex::new(versions),
        state: RwLock::new(state),
        wal: Mutex::new(Some(wal_writer)),
        write_queue: Mutex::new(()),
        next_sequence: AtomicU64::new(max_replayed_seq + 1),
        visible_sequence: AtomicU64::new(max_replayed_seq),
        tables: Mutex::new(HashMap::new()),
        pending_files: Mutex::new(Vec::new()),
        flush_lock: Mutex::new(()),
        flush_done: Condvar::new(),
        fatal: Mutex::new(None),
        fatal_set: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        close_result: Mutex::new(None),
        open_iterators: AtomicUsize::new(0),
        lock: Mutex::new(Some(lock)),
        background: Background {
            sender: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        },
        opts,
    });

    // 6 + 7 (second half). Flush the replayed memtable (which records
    // the fresh WAL as the new log number), or record the WAL number
    // directly when there is nothing to flush.
    if replay_nonempty {
        flush::flush_one(&inner)?;
    } else {
        let mut edit = VersionEdit {
            log_number: Some(new_wal_number),
            ..VersionEdit::default()
        };
        lock_or_recover(&inner.versions).log_and_apply(&mut edit)?;
        inner.remove_obsolete_files();
    }

    info!(
        path = %inner.path.display(),
        last_sequence = max_replayed_seq,
        wal = new_wal_number,
        "database opened"
    );
    Ok(inner)
}

/// Remove orphaned tables, stale manifests, and temp files; return the
/// WAL numbers that must be replayed, ascending.
fn sweep_directory(
    fs: &Arc<dyn crate::vfs::FileSystem>,
    path: &Path,
    versions: &VersionSet,
    paranoid_checks: bool,
) -> DbResult<Vec<u64>> {
    let live = versions.live_files();
    let min_log = versions.log_number();

    // The manifest CURRENT names is the only one worth keeping.
    let current_manifest = read_file_to_vec(&**fs, &filenames::current_file_name(path))
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|text| filenames::parse_current_contents(&text));

    let mut wal_numbers = Vec::new();
    for entry in fs.list_dir(path)? {
        let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match filenames::parse_file_name(name) {
            Some(FileKind::Table(number)) => {
                if !live.contains(&number) {
                    fs.remove(&entry)?;
                    info!(file = number, "removed orphaned table");
                }
            }
            Some(FileKind::WriteAheadLog(number)) => {
                if number >= min_log {
                    wal_numbers.push(number);
                } else {
                    fs.remove(&entry)?;
                    debug!(wal = number, "removed obsolete WAL");
                }
            }
            Some(FileKind::Manifest(number)) => {
                if current_manifest.is_some_and(|active| number != active) {
                    fs.remove(&entry)?;
                    debug!(manifest = number, "removed superseded manifest");
                }
            }
            Some(FileKind::CurrentTmp) => {
                fs.remove(&entry)?;
                debug!("removed stale CURRENT.tmp");
            }
            Some(FileKind::Current | FileKind::Lock) => {}
            None => {
                if paranoid_checks {
                    return Err(DbError::Corruption(format!(
                        "unrecognized file in database directory: {name}"
                    )));
                }
                warn!(file = name, "ignoring unrecognized file");
            }
        }
    }
    wal_numbers.sort_unstable();
    Ok(wal_numbers)
}

/// Replay one WAL into `mem`; returns the highest sequence applied.
///
/// Tail truncation ends the log quietly (the writer died mid-append); a
/// damaged frame *inside* the durable prefix is real corruption and
/// fails the open.
fn replay_wal(
    fs: &Arc<dyn crate::vfs::FileSystem>,
    path: &Path,
    number: u64,
    mem: &Memtable,
) -> DbResult<u64> {
    let log_path = filenames::log_file_name(path, number);
    let file = fs.open_sequential(&log_path)?;
    let mut reader = LogReader::new(file, false);
    let mut max_seq = 0u64;
    let mut batches = 0u64;

    while let Some(record) = reader.read_record()? {
        let batch = WriteBatch::from_encoded(record)?;
        apply_batch(&batch, mem)?;
        max_seq = max_seq.max(batch.end_sequence().saturating_sub(1));
        batches += 1;
    }
    match reader.end_of_log() {
        EndOfLog::CleanEof | EndOfLog::NotReached => {}
        EndOfLog::TruncatedTail => {
            info!(wal = number, "WAL tail truncated mid-append; treated as end of log");
        }
        EndOfLog::Corruption { offset, reason } => {
            return Err(DbError::Corruption(format!(
                "WAL {number} damaged at offset {offset}: {reason}"
            )));
        }
    }
    debug!(wal = number, batches, max_seq, "WAL replayed");
    Ok(max_seq)
}
