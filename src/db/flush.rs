//! Flush job — seal-side of the LSM: one sealed memtable becomes one
//! level-0 table.
//!
//! The job runs in a fixed order, with a sync point at each boundary and
//! kill points before and after every durable step:
//!
//! ```text
//! [Flush.Start:0]
//! allocate file number
//! create <n>.sst
//! [Flush.WriteSST:0]          crash here: table absent or partial
//! add entries + range tombstones, finish
//! [File.Sync:0] sync [File.Sync:1]
//! [SST.Close:0] close [SST.Close:1]
//! [Dir.Sync:0] sync_dir(db) [Dir.Sync:1]
//! [Flush.UpdateManifest:0]    crash here: orphaned table on disk
//! log_and_apply(add file, log_number = next needed WAL)
//! [Flush.UpdateManifest:1]    table is part of the canonical version
//! drop the sealed memtable
//! ```
//!
//! A failure before the manifest append leaves the version unchanged and
//! the sealed memtable in place; recovery removes the orphaned table.

use tracing::{debug, info, warn};

use crate::crashpoint::{kill_point, sync_point};
use crate::filenames;
use crate::keys::{InternalKey, ValueKind};
use crate::manifest::{FileMetaData, VersionEdit};
use crate::memtable::Memtable;
use crate::sstable::TableBuilder;

use super::{DbError, DbInner, DbResult, lock_or_recover, lock_or_recover_read, lock_or_recover_write};

/// Flush the oldest sealed memtable, if any. Serialized against other
/// flushes by the flush lock.
pub(crate) fn flush_one(inner: &DbInner) -> DbResult<()> {
    let _flush = lock_or_recover(&inner.flush_lock);
    sync_point("FlushJob::Run:Start");

    let Some(target) = ({
        let state = lock_or_recover_read(&inner.state);
        state.immutables.first().cloned()
    }) else {
        return Ok(());
    };
    kill_point("Flush.Start:0");

    if target.mem.is_empty() {
        // Nothing to materialize; just drop the sealed table.
        let mut state = lock_or_recover_write(&inner.state);
        state.immutables.retain(|imm| imm.wal_number != target.wal_number);
        inner.notify_flush_done();
        return Ok(());
    }

    // After this flush, the oldest WAL still needed is the next sealed
    // memtable's (or the active one's).
    let next_log_number = {
        let state = lock_or_recover_read(&inner.state);
        state
            .immutables
            .iter()
            .filter(|imm| imm.wal_number != target.wal_number)
            .map(|imm| imm.wal_number)
            .min()
            .unwrap_or(state.active_wal_number)
    };

    let file_number = flush_memtable(inner, &target.mem, next_log_number)?;

    {
        let mut state = lock_or_recover_write(&inner.state);
        state.immutables.retain(|imm| imm.wal_number != target.wal_number);
    }
    if let Some(listener) = &inner.opts.listener {
        listener.on_flush_completed(file_number);
    }
    inner.notify_flush_done();
    inner.remove_obsolete_files();
    info!(file = file_number, wal = target.wal_number, "memtable flushed");
    sync_point("FlushJob::Run:Complete");
    Ok(())
}

/// Materialize `mem` into a new level-0 table and install it with
/// `log_number`. Shared by background flushes and the recovery flush.
///
/// Returns the new table's file number.
pub(crate) fn flush_memtable(
    inner: &DbInner,
    mem: &Memtable,
    log_number: u64,
) -> DbResult<u64> {
    let file_number = lock_or_recover(&inner.versions).new_file_number();
    let path = filenames::table_file_name(&inner.path, file_number);
    let file = inner.fs.create(&path)?;
    kill_point("Flush.WriteSST:0");
    sync_point("FlushJob::Run:WriteSST");

    let mut builder = TableBuilder::with_params(
        file,
        inner.opts.block_size,
        inner.opts.block_restart_interval,
    );
    let mut smallest: Option<InternalKey> = None;
    let mut largest: Option<InternalKey> = None;

    let build = (|| -> DbResult<()> {
        for (key, value) in mem.iter() {
            if smallest.is_none() {
                smallest = Some(key.clone());
            }
            largest = Some(key.clone());
            builder.add(&key, &value)?;
        }
        let tombstones = mem.range_tombstones();
        for tombstone in &tombstones {
            // The file's key range must cover its tombstones.
            let start = InternalKey::new(
                &tombstone.start,
                tombstone.sequence,
                ValueKind::RangeDeletion,
            );
            let end = InternalKey::new(&tombstone.end, 0, ValueKind::RangeDeletion);
            if smallest.as_ref().is_none_or(|s| start < *s) {
                smallest = Some(start);
            }
            if largest.as_ref().is_none_or(|l| end > *l) {
                largest = Some(end);
            }
        }
        builder.add_range_tombstones(&tombstones)?;

        if builder.num_entries() == 0 && builder.num_range_tombstones() == 0 {
            return Err(DbError::InvalidArgument("flushing an empty memtable".into()));
        }
        builder.finish()?;
        sync_point("FlushJob::Run:SyncSST");
        kill_point("File.Sync:0");
        builder.sync()?;
        kill_point("File.Sync:1");
        kill_point("SST.Close:0");
        builder.close()?;
        kill_point("SST.Close:1");
        Ok(())
    })();

    if let Err(err) = build {
        builder.abandon();
        if inner.fs.remove(&path).is_err() {
            warn!(file = file_number, "partial table left behind; recovery will remove it");
        }
        return Err(err);
    }

    kill_point("Dir.Sync:0");
    inner.fs.sync_dir(&inner.path)?;
    kill_point("Dir.Sync:1");

    let (smallest, largest) = match (smallest, largest) {
        (Some(s), Some(l)) => (s, l),
        _ => {
            return Err(DbError::InvalidArgument(
                "flush produced no key range".into(),
            ));
        }
    };
    let (smallest_seqno, largest_seqno) = builder.sequence_bounds();
    let meta = FileMetaData {
        file_number,
        level: 0,
        file_size: builder.file_size(),
        smallest,
        largest,
        smallest_seqno,
        largest_seqno,
    };
    debug!(
        file = file_number,
        entries = builder.num_entries(),
        bytes = meta.file_size,
        "table written; updating manifest"
    );

    kill_point("Flush.UpdateManifest:0");
    sync_point("FlushJob::Run:ApplyVersionEdit");
    let mut edit = VersionEdit {
        log_number: Some(log_number),
        new_files: vec![meta],
        ..VersionEdit::default()
    };
    lock_or_recover(&inner.versions).log_and_apply(&mut edit)?;
    kill_point("Flush.UpdateManifest:1");
    Ok(file_number)
}
