//! In-memory write buffer keyed by internal keys.
//!
//! ## Design invariants
//!
//! - Entries are keyed by [`InternalKey`] (user key ∥ sequence/kind tag),
//!   so the memtable may hold many versions of a user key; the
//!   highest-sequence version visible at a snapshot is authoritative.
//! - Deletes are tombstone entries, never physical removal.
//! - Range tombstones live in a parallel structure and logically delete
//!   point records in `[start, end)` with lower sequences.
//! - `get` resolves point entries against range tombstones; iteration
//!   exposes raw entries and leaves visibility to the caller.
//!
//! ## Concurrency
//!
//! The point map is a lock-free skip list ([`crossbeam_skiplist::SkipMap`],
//! epoch-reclaimed): readers never block, writers are serialized by the
//! engine's write queue. Range tombstones sit behind a small `RwLock`;
//! they are rare and read-mostly.
//!
//! ## Lifecycle
//!
//! A memtable is write-once-then-immutable: once the engine seals it (on
//! crossing the write-buffer threshold or a manual flush), no further
//! `add` calls are made and the sealed table becomes a flush input. The
//! type itself stays unaware of sealing; the engine enforces it by
//! construction (only the active table is ever handed to the write path).

#[cfg(test)]
mod tests;

use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use tracing::trace;

use crate::keys::{DisplayBytes, InternalKey, SequenceNumber, ValueKind};

/// Fixed per-entry overhead charged to the memory accounting, covering
/// skip-list node and tag storage.
const ENTRY_OVERHEAD: usize = 64;

// ------------------------------------------------------------------------------------------------
// Data types
// ------------------------------------------------------------------------------------------------

/// A range tombstone deleting `[start, end)` at `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    /// Inclusive start key of the deleted range.
    pub start: Vec<u8>,

    /// Exclusive end key of the deleted range.
    pub end: Vec<u8>,

    /// Sequence number of this tombstone.
    pub sequence: SequenceNumber,
}

impl RangeTombstone {
    /// Whether this tombstone covers `user_key`.
    pub fn covers(&self, user_key: &[u8]) -> bool {
        self.start.as_slice() <= user_key && user_key < self.end.as_slice()
    }
}

/// Result of a point lookup against one memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGet {
    /// A live value visible at the snapshot.
    Value(Vec<u8>),

    /// The key is deleted (point or range tombstone) at the snapshot.
    Deleted,

    /// This memtable holds no visible record for the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// An ordered, multi-version in-memory table.
pub struct Memtable {
    map: SkipMap<InternalKey, Vec<u8>>,
    range_tombstones: RwLock<Vec<RangeTombstone>>,
    approximate_usage: AtomicUsize,
    entries: AtomicU64,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("entries", &self.entries.load(Ordering::Relaxed))
            .field("bytes", &self.approximate_usage.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    /// An empty memtable.
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            range_tombstones: RwLock::new(Vec::new()),
            approximate_usage: AtomicUsize::new(0),
            entries: AtomicU64::new(0),
        }
    }

    /// Insert one record.
    ///
    /// For [`ValueKind::RangeDeletion`] the `value` carries the exclusive
    /// end key and the record is routed to the range-tombstone structure.
    pub fn add(&self, sequence: SequenceNumber, kind: ValueKind, user_key: &[u8], value: &[u8]) {
        if kind == ValueKind::RangeDeletion {
            self.add_range_tombstone(user_key, value, sequence);
            return;
        }
        trace!(
            seq = sequence,
            kind = kind as u8,
            key = %DisplayBytes(user_key),
            "memtable add"
        );
        let key = InternalKey::new(user_key, sequence, kind);
        let charged = key.encoded().len() + value.len() + ENTRY_OVERHEAD;
        self.map.insert(key, value.to_vec());
        self.approximate_usage.fetch_add(charged, Ordering::Relaxed);
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a range tombstone over `[start_key, end_key)`.
    pub fn add_range_tombstone(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        sequence: SequenceNumber,
    ) {
        trace!(
            seq = sequence,
            start = %DisplayBytes(start_key),
            end = %DisplayBytes(end_key),
            "memtable range tombstone"
        );
        let charged = start_key.len() + end_key.len() + ENTRY_OVERHEAD;
        let tombstone = RangeTombstone {
            start: start_key.to_vec(),
            end: end_key.to_vec(),
            sequence,
        };
        match self.range_tombstones.write() {
            Ok(mut guard) => guard.push(tombstone),
            Err(poisoned) => poisoned.into_inner().push(tombstone),
        }
        self.approximate_usage.fetch_add(charged, Ordering::Relaxed);
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Look up the most recent record for `user_key` with sequence ≤
    /// `snapshot`, masking point records older than a covering range
    /// tombstone.
    pub fn get(&self, user_key: &[u8], snapshot: SequenceNumber) -> MemtableGet {
        let point = self.get_point(user_key, snapshot);
        let tombstone_seq = self.max_covering_tombstone(user_key, snapshot);

        match (point, tombstone_seq) {
            (None, None) => MemtableGet::NotFound,
            (None, Some(_)) => MemtableGet::Deleted,
            (Some((seq, kind, value)), covering) => {
                if covering.is_some_and(|tomb_seq| tomb_seq > seq) {
                    return MemtableGet::Deleted;
                }
                match kind {
                    ValueKind::Value => MemtableGet::Value(value),
                    _ => MemtableGet::Deleted,
                }
            }
        }
    }

    /// The newest point record for `user_key` with sequence ≤ `snapshot`,
    /// *without* range-tombstone resolution. Cross-source readers merge
    /// tombstones themselves.
    pub fn get_point(
        &self,
        user_key: &[u8],
        snapshot: SequenceNumber,
    ) -> Option<(SequenceNumber, ValueKind, Vec<u8>)> {
        let lookup = InternalKey::for_lookup(user_key, snapshot);
        self.map
            .range((Bound::Included(lookup), Bound::Unbounded))
            .next()
            .filter(|entry| entry.key().user_key() == user_key)
            .map(|entry| {
                (
                    entry.key().sequence(),
                    entry.key().kind(),
                    entry.value().clone(),
                )
            })
    }

    /// Highest tombstone sequence ≤ `snapshot` covering `user_key`.
    pub fn max_covering_tombstone(
        &self,
        user_key: &[u8],
        snapshot: SequenceNumber,
    ) -> Option<SequenceNumber> {
        let guard = match self.range_tombstones.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .iter()
            .filter(|t| t.sequence <= snapshot && t.covers(user_key))
            .map(|t| t.sequence)
            .max()
    }

    /// All point entries in internal-key order (owned).
    pub fn iter(&self) -> impl Iterator<Item = (InternalKey, Vec<u8>)> + '_ {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// Snapshot of the range tombstones, ordered by start key then
    /// descending sequence.
    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        let guard = match self.range_tombstones.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut tombstones = guard.clone();
        tombstones.sort_by(|a, b| a.start.cmp(&b.start).then(b.sequence.cmp(&a.sequence)));
        tombstones
    }

    /// Approximate bytes of memory held by entries.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_usage.load(Ordering::Relaxed)
    }

    /// Number of records inserted (point entries + range tombstones).
    pub fn num_entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Whether the table holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Highest sequence number present in this table, if any.
    pub fn max_sequence(&self) -> Option<SequenceNumber> {
        let points = self.map.iter().map(|entry| entry.key().sequence()).max();
        let guard = match self.range_tombstones.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ranges = guard.iter().map(|t| t.sequence).max();
        points.max(ranges)
    }
}
