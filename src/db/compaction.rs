//! Compaction job — merge N input tables into ≥1 output tables one level
//! down, then drop the inputs from the version.
//!
//! Only the *mechanism* lives here: inputs are whatever overlaps the
//! caller's key range on levels 0 and 1, outputs land on level 1.
//! Heuristics for picking work are deliberately absent.
//!
//! The job preserves every record version it reads — visibility is a
//! read-side concern and snapshot readers may still need older versions.
//! Range tombstones from the inputs are carried into every output whose
//! key range they may cover (duplicated, never split).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tracing::{debug, info};

use crate::crashpoint::{kill_point, sync_point};
use crate::filenames;
use crate::keys::InternalKey;
use crate::manifest::{FileMetaData, VersionEdit};
use crate::memtable::RangeTombstone;
use crate::sstable::{TableBuilder, TableIter};

use super::{DbError, DbInner, DbResult, lock_or_recover};

/// Target size of one compaction output file.
const OUTPUT_TARGET_BYTES: u64 = 8 * 1024 * 1024;

/// Merge the tables overlapping `[start, end]` on levels 0 and 1 into
/// level 1.
pub(crate) fn compact_range(
    inner: &DbInner,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> DbResult<()> {
    // Serialize with flushes: both mutate the version and the file set.
    let _flush = lock_or_recover(&inner.flush_lock);
    sync_point("CompactionJob::Run:Start");
    kill_point("Compaction.Start:0");

    let version = lock_or_recover(&inner.versions).current();
    let mut inputs = version.overlapping_files(0, start, end);
    inputs.extend(version.overlapping_files(1, start, end));
    // Release the version now so the inputs' only remaining pins after
    // installation are iterators, not this job.
    drop(version);
    if inputs.is_empty() {
        debug!("compaction found no overlapping inputs");
        return Ok(());
    }

    sync_point("CompactionJob::Run:OpenInputs");
    let mut tables = Vec::with_capacity(inputs.len());
    for meta in &inputs {
        tables.push(inner.table(meta)?);
    }

    // Range tombstones from every input ride along into the outputs.
    let mut carried_tombstones: Vec<RangeTombstone> = Vec::new();
    for table in &tables {
        carried_tombstones.extend_from_slice(table.range_tombstones());
    }

    sync_point("CompactionJob::Run:Processing");
    let mut merge = MergingIter::new(tables.iter().map(|t| t.iter()).collect())?;

    kill_point("Compaction.WriteSST:0");
    sync_point("CompactionJob::Run:WriteOutput");

    let mut outputs: Vec<FileMetaData> = Vec::new();
    let mut current: Option<OutputFile> = None;
    let mut last_emitted: Option<InternalKey> = None;

    while let Some((key, value)) = merge.next_entry()? {
        // Identical internal keys across inputs collapse to one record.
        if last_emitted.as_ref() == Some(&key) {
            continue;
        }
        last_emitted = Some(key.clone());

        if current.is_none() {
            let file_number = lock_or_recover(&inner.versions).new_file_number();
            current = Some(OutputFile::create(inner, file_number)?);
        }
        let output = current.as_mut().ok_or_else(|| {
            DbError::InvalidArgument("output vanished mid-compaction".into())
        })?;
        output.add(&key, &value)?;

        if output.builder.file_size() >= OUTPUT_TARGET_BYTES {
            let finished = current.take().ok_or_else(|| {
                DbError::InvalidArgument("output vanished mid-compaction".into())
            })?;
            outputs.push(finished.finish(inner, &carried_tombstones)?);
            sync_point("CompactionJob::Run:FinishOutput");
        }
    }
    if let Some(output) = current.take() {
        outputs.push(output.finish(inner, &carried_tombstones)?);
        sync_point("CompactionJob::Run:FinishOutput");
    }

    // Inputs that were only tombstones still need an output to carry
    // them.
    if outputs.is_empty() && !carried_tombstones.is_empty() {
        let file_number = lock_or_recover(&inner.versions).new_file_number();
        let output = OutputFile::create(inner, file_number)?;
        outputs.push(output.finish(inner, &carried_tombstones)?);
        sync_point("CompactionJob::Run:FinishOutput");
    }

    kill_point("Dir.Sync:0");
    inner.fs.sync_dir(&inner.path)?;
    kill_point("Dir.Sync:1");

    let mut edit = VersionEdit {
        deleted_files: inputs
            .iter()
            .map(|meta| (meta.level, meta.file_number))
            .collect(),
        new_files: outputs.clone(),
        ..VersionEdit::default()
    };
    lock_or_recover(&inner.versions).log_and_apply(&mut edit)?;

    kill_point("Compaction.DeleteInput:0");
    // The manifest points past the inputs; they go once no iterator
    // pins them.
    inner.retire_files(inputs);
    info!(
        outputs = outputs.len(),
        "compaction installed"
    );
    sync_point("CompactionJob::Run:Complete");
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Output file
// ------------------------------------------------------------------------------------------------

struct OutputFile {
    file_number: u64,
    builder: TableBuilder,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
}

impl OutputFile {
    fn create(inner: &DbInner, file_number: u64) -> DbResult<Self> {
        let path = filenames::table_file_name(&inner.path, file_number);
        let file = inner.fs.create(&path)?;
        Ok(Self {
            file_number,
            builder: TableBuilder::with_params(
                file,
                inner.opts.block_size,
                inner.opts.block_restart_interval,
            ),
            smallest: None,
            largest: None,
        })
    }

    fn add(&mut self, key: &InternalKey, value: &[u8]) -> DbResult<()> {
        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.largest = Some(key.clone());
        self.builder.add(key, value)?;
        Ok(())
    }

    fn finish(
        mut self,
        inner: &DbInner,
        tombstones: &[RangeTombstone],
    ) -> DbResult<FileMetaData> {
        self.builder.add_range_tombstones(tombstones)?;
        for tombstone in tombstones {
            let start = InternalKey::new(
                &tombstone.start,
                tombstone.sequence,
                crate::keys::ValueKind::RangeDeletion,
            );
            let end =
                InternalKey::new(&tombstone.end, 0, crate::keys::ValueKind::RangeDeletion);
            if self.smallest.as_ref().is_none_or(|s| start < *s) {
                self.smallest = Some(start);
            }
            if self.largest.as_ref().is_none_or(|l| end > *l) {
                self.largest = Some(end);
            }
        }

        let result = (|| -> DbResult<()> {
            self.builder.finish()?;
            kill_point("File.Sync:0");
            self.builder.sync()?;
            kill_point("File.Sync:1");
            kill_point("SST.Close:0");
            self.builder.close()?;
            kill_point("SST.Close:1");
            Ok(())
        })();
        if let Err(err) = result {
            self.builder.abandon();
            let path = filenames::table_file_name(&inner.path, self.file_number);
            let _ = inner.fs.remove(&path);
            return Err(err);
        }

        let (smallest, largest) = match (self.smallest, self.largest) {
            (Some(s), Some(l)) => (s, l),
            _ => {
                return Err(DbError::InvalidArgument(
                    "compaction output has no key range".into(),
                ));
            }
        };
        let (smallest_seqno, largest_seqno) = self.builder.sequence_bounds();
        Ok(FileMetaData {
            file_number: self.file_number,
            level: 1,
            file_size: self.builder.file_size(),
            smallest,
            largest,
            smallest_seqno,
            largest_seqno,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Merging iterator
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    key: InternalKey,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then(self.source.cmp(&other.source))
    }
}

/// K-way merge over table iterators in internal-key order.
struct MergingIter<'a> {
    sources: Vec<TableIter<'a>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl<'a> MergingIter<'a> {
    fn new(mut sources: Vec<TableIter<'a>>) -> DbResult<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter_mut().enumerate() {
            if let Some((key, value)) = source.next_entry()? {
                heap.push(Reverse(HeapEntry { key, value, source: index }));
            }
        }
        Ok(Self { sources, heap })
    }

    fn next_entry(&mut self) -> DbResult<Option<(InternalKey, Vec<u8>)>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some((key, value)) = self.sources[entry.source].next_entry()? {
            self.heap.push(Reverse(HeapEntry {
                key,
                value,
                source: entry.source,
            }));
        }
        Ok(Some((entry.key, entry.value)))
    }
}
