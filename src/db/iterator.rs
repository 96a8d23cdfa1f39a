//! Database iterators — snapshot view over memtables + the current
//! version.
//!
//! An iterator captures the visible sequence at creation time plus
//! references to the memtables and the version, so concurrent flushes
//! and compactions never change what it yields. Yielded keys and values
//! are owned by the caller; mutating them cannot affect the database or
//! later reads.
//!
//! Construction merges all sources in internal-key order and applies
//! visibility: for each user key the newest record at the snapshot wins,
//! point tombstones suppress the key, and range tombstones suppress any
//! older covered record.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::keys::{InternalKey, SequenceNumber, ValueKind};
use crate::memtable::RangeTombstone;

use super::{DbInner, DbResult, ReadOptions, lock_or_recover, lock_or_recover_read};

/// Owned snapshot iterator; see the module docs.
pub struct DbIterator {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    guard: Option<IterGuard>,
}

/// Keeps the iterator counted (for close) and the version pinned (so
/// compaction cannot delete files out from under a sibling iterator).
struct IterGuard {
    inner: Arc<DbInner>,
    _version: Arc<crate::manifest::Version>,
}

impl Drop for IterGuard {
    fn drop(&mut self) {
        self.inner.open_iterators.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("closed", &self.guard.is_none())
            .finish_non_exhaustive()
    }
}

impl DbIterator {
    /// Release the iterator's references early. Idempotent; a
    /// double-closed iterator yields nothing and harms nothing.
    pub fn close(&mut self) {
        self.guard.take();
        self.entries = Vec::new().into_iter();
    }
}

impl Iterator for DbIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// Build a snapshot iterator over everything visible at the read
/// options' snapshot.
pub(crate) fn new_iterator(inner: &Arc<DbInner>, opts: &ReadOptions) -> DbResult<DbIterator> {
    let snapshot = opts
        .snapshot
        .unwrap_or_else(|| inner.visible_sequence.load(Ordering::Acquire));

    let (active, immutables) = {
        let state = lock_or_recover_read(&inner.state);
        (Arc::clone(&state.active), state.immutables.clone())
    };
    let version = lock_or_recover(&inner.versions).current();

    // Gather raw entries and tombstones from every source.
    let mut raw: Vec<(InternalKey, Vec<u8>)> = Vec::new();
    let mut tombstones: Vec<RangeTombstone> = Vec::new();

    raw.extend(active.iter());
    tombstones.extend(active.range_tombstones());
    for immutable in &immutables {
        raw.extend(immutable.mem.iter());
        tombstones.extend(immutable.mem.range_tombstones());
    }
    for level in 0..version.num_levels() {
        for meta in version.files(level) {
            let table = inner.table(meta)?;
            let mut iter = table.iter();
            while let Some(entry) = iter.next_entry()? {
                raw.push(entry);
            }
            tombstones.extend_from_slice(table.range_tombstones());
        }
    }

    raw.sort_by(|a, b| a.0.cmp(&b.0));
    tombstones.retain(|t| t.sequence <= snapshot);

    // Visibility pass: internal-key order puts the newest version of a
    // user key first, so the first visible record decides.
    let mut visible: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut resolved_user: Option<Vec<u8>> = None;
    for (key, value) in raw {
        if key.sequence() > snapshot {
            continue;
        }
        let user = key.user_key();
        if resolved_user.as_deref() == Some(user) {
            continue;
        }
        resolved_user = Some(user.to_vec());
        if key.kind() != ValueKind::Value {
            continue;
        }
        if covered_by_tombstone(&tombstones, user, key.sequence()) {
            continue;
        }
        visible.push((user.to_vec(), value));
    }

    inner.open_iterators.fetch_add(1, Ordering::AcqRel);
    trace!(
        snapshot,
        entries = visible.len(),
        "iterator materialized"
    );
    Ok(DbIterator {
        entries: visible.into_iter(),
        guard: Some(IterGuard {
            inner: Arc::clone(inner),
            _version: version,
        }),
    })
}

fn covered_by_tombstone(
    tombstones: &[RangeTombstone],
    user_key: &[u8],
    sequence: SequenceNumber,
) -> bool {
    tombstones
        .iter()
        .any(|t| t.covers(user_key) && t.sequence > sequence)
}
