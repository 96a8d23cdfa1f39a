//! Expected-state oracle — a persistent shadow of per-key state used to
//! verify the database after a crash.
//!
//! ## Model
//!
//! The oracle tracks a fixed keyspace: `num_cfs` column families ×
//! `max_key` integer keys. Each `(cf, key)` slot is one bit-packed `u32`:
//!
//! ```text
//! bit  0..15   value_base (15 bits) — generation of the last put
//! bit  15      pending_write       — a put has started, not yet acked
//! bit 16..30   del_counter (14 bits) — completed deletes
//! bit  30      pending_delete      — a delete has started, not yet acked
//! bit  31      deleted             — the key is absent
//! ```
//!
//! Writers call `begin_put`/`begin_delete` before issuing the database
//! operation and `commit` on the returned pending guard once the
//! operation is acknowledged. A crash can strand a slot in a pending
//! state; on load the oracle resolves it by **conservative persistence**:
//! a pending operation is assumed to have completed. This is a
//! verification policy of the oracle (it may produce false-positive
//! mismatches for operations that never reached the WAL), not an
//! invariant of the storage engine.
//!
//! ## File formats
//!
//! Snapshot (`expected_state.bin` / `expected_state.bin.durable`):
//!
//! ```text
//! magic "EXSTATE2" (8) | version u32 =1 | num_cfs u32 | max_key u64
//! log2_keys_per_lock u32 | seqno u64 | num_cfs*max_key slots (u32 LE)
//! ```
//!
//! Trace (`<base>.trace`): header
//! `magic "RKYTRACE" (8) | version u32 =1 | start_seq u64 | num_cfs u32 |
//! max_key u64`, then fixed 24-byte records
//! `{op u8, cf u8, pad u16, key u64, value_base u32, seqno u64}` with
//! `op ∈ {Put=1, Delete=2}`. Replaying a trace up to the recovered
//! sequence number reconstructs the exact expected state of a crashed
//! database.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Snapshot file magic.
pub const STATE_MAGIC: [u8; 8] = *b"EXSTATE2";

/// Trace file magic.
pub const TRACE_MAGIC: [u8; 8] = *b"RKYTRACE";

/// Conventional snapshot file name, updated as the workload runs.
pub const STATE_FILE: &str = "expected_state.bin";

/// Conventional name for the snapshot written at a durability barrier
/// (after a flush); survives crashes by definition.
pub const STATE_FILE_DURABLE: &str = "expected_state.bin.durable";

/// Format version for both files.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed trace record length.
pub const TRACE_RECORD_LEN: usize = 24;

const VALUE_BASE_MASK: u32 = 0x7fff;
const PENDING_WRITE_BIT: u32 = 1 << 15;
const DEL_COUNTER_SHIFT: u32 = 16;
const DEL_COUNTER_MASK: u32 = 0x3fff;
const PENDING_DELETE_BIT: u32 = 1 << 30;
const DELETED_BIT: u32 = 1 << 31;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by oracle persistence.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A snapshot or trace file is malformed.
    #[error("oracle file corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// Slot view
// ------------------------------------------------------------------------------------------------

/// Decoded view of one `(cf, key)` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    /// Generation of the last put.
    pub value_base: u32,
    /// Completed deletes.
    pub del_counter: u32,
    /// A put is in flight.
    pub pending_write: bool,
    /// A delete is in flight.
    pub pending_delete: bool,
    /// The key is absent.
    pub deleted: bool,
}

impl SlotState {
    fn unpack(raw: u32) -> Self {
        Self {
            value_base: raw & VALUE_BASE_MASK,
            del_counter: (raw >> DEL_COUNTER_SHIFT) & DEL_COUNTER_MASK,
            pending_write: raw & PENDING_WRITE_BIT != 0,
            pending_delete: raw & PENDING_DELETE_BIT != 0,
            deleted: raw & DELETED_BIT != 0,
        }
    }

    fn pack(self) -> u32 {
        let mut raw = self.value_base & VALUE_BASE_MASK;
        raw |= (self.del_counter & DEL_COUNTER_MASK) << DEL_COUNTER_SHIFT;
        if self.pending_write {
            raw |= PENDING_WRITE_BIT;
        }
        if self.pending_delete {
            raw |= PENDING_DELETE_BIT;
        }
        if self.deleted {
            raw |= DELETED_BIT;
        }
        raw
    }
}

// ------------------------------------------------------------------------------------------------
// ExpectedState
// ------------------------------------------------------------------------------------------------

/// The in-memory oracle over a fixed keyspace.
pub struct ExpectedState {
    num_cfs: u32,
    max_key: u64,
    log2_keys_per_lock: u32,
    slots: Vec<AtomicU32>,
    seqno: AtomicU64,
}

impl std::fmt::Debug for ExpectedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpectedState")
            .field("num_cfs", &self.num_cfs)
            .field("max_key", &self.max_key)
            .field("seqno", &self.seqno.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ExpectedState {
    /// A fresh oracle: every key starts deleted with generation 0.
    pub fn new(num_cfs: u32, max_key: u64) -> Self {
        let total = num_cfs as usize * max_key as usize;
        let mut slots = Vec::with_capacity(total);
        for _ in 0..total {
            slots.push(AtomicU32::new(DELETED_BIT));
        }
        Self {
            num_cfs,
            max_key,
            log2_keys_per_lock: 10,
            slots,
            seqno: AtomicU64::new(0),
        }
    }

    /// Number of column families tracked.
    pub fn num_cfs(&self) -> u32 {
        self.num_cfs
    }

    /// Keys per column family.
    pub fn max_key(&self) -> u64 {
        self.max_key
    }

    /// The sequence number this state was last synchronized at.
    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    /// Record the sequence number the state reflects.
    pub fn set_seqno(&self, seqno: u64) {
        self.seqno.store(seqno, Ordering::Release);
    }

    fn slot(&self, cf: u32, key: u64) -> &AtomicU32 {
        debug_assert!(cf < self.num_cfs && key < self.max_key);
        &self.slots[cf as usize * self.max_key as usize + key as usize]
    }

    /// Decoded state of `(cf, key)`.
    pub fn state(&self, cf: u32, key: u64) -> SlotState {
        SlotState::unpack(self.slot(cf, key).load(Ordering::Acquire))
    }

    /// Whether the key currently exists (pending operations resolved
    /// conservatively: a pending put counts as existing).
    pub fn exists(&self, cf: u32, key: u64) -> bool {
        let state = self.state(cf, key);
        if state.pending_write {
            return true;
        }
        !state.deleted && !state.pending_delete
    }

    /// Generation of the last put, or `None` when the key is absent.
    pub fn value_base(&self, cf: u32, key: u64) -> Option<u32> {
        let state = self.state(cf, key);
        if self.exists(cf, key) {
            Some(state.value_base)
        } else {
            None
        }
    }

    /// Start a put of generation `value_base`; commit the guard once the
    /// database acknowledges the write.
    pub fn begin_put(&self, cf: u32, key: u64, value_base: u32) -> PendingPut<'_> {
        let slot = self.slot(cf, key);
        let mut state = SlotState::unpack(slot.load(Ordering::Acquire));
        state.value_base = value_base & VALUE_BASE_MASK;
        state.pending_write = true;
        state.deleted = false;
        slot.store(state.pack(), Ordering::Release);
        PendingPut { oracle: self, cf, key }
    }

    /// Start a delete; commit the guard once acknowledged.
    pub fn begin_delete(&self, cf: u32, key: u64) -> PendingDelete<'_> {
        let slot = self.slot(cf, key);
        let mut state = SlotState::unpack(slot.load(Ordering::Acquire));
        state.pending_delete = true;
        slot.store(state.pack(), Ordering::Release);
        PendingDelete { oracle: self, cf, key }
    }

    fn commit_put(&self, cf: u32, key: u64) {
        let slot = self.slot(cf, key);
        let mut state = SlotState::unpack(slot.load(Ordering::Acquire));
        state.pending_write = false;
        state.deleted = false;
        slot.store(state.pack(), Ordering::Release);
    }

    fn commit_delete(&self, cf: u32, key: u64) {
        let slot = self.slot(cf, key);
        let mut state = SlotState::unpack(slot.load(Ordering::Acquire));
        state.pending_delete = false;
        state.deleted = true;
        state.del_counter = (state.del_counter + 1) & DEL_COUNTER_MASK;
        slot.store(state.pack(), Ordering::Release);
    }

    /// Resolve stranded pending bits by assuming the in-flight operation
    /// completed (conservative persistence).
    pub fn resolve_pending(&self) {
        for slot in &self.slots {
            let mut state = SlotState::unpack(slot.load(Ordering::Acquire));
            if state.pending_delete {
                state.pending_delete = false;
                state.deleted = true;
                state.del_counter = (state.del_counter + 1) & DEL_COUNTER_MASK;
            }
            if state.pending_write {
                state.pending_write = false;
                state.deleted = false;
            }
            slot.store(state.pack(), Ordering::Release);
        }
    }

    // --------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------

    /// Write a snapshot to `path` atomically (temp file, rename, parent
    /// directory sync).
    pub fn save(&self, path: &Path) -> Result<(), OracleError> {
        let mut contents =
            Vec::with_capacity(36 + self.slots.len() * 4);
        contents.extend_from_slice(&STATE_MAGIC);
        contents.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        contents.extend_from_slice(&self.num_cfs.to_le_bytes());
        contents.extend_from_slice(&self.max_key.to_le_bytes());
        contents.extend_from_slice(&self.log2_keys_per_lock.to_le_bytes());
        contents.extend_from_slice(&self.seqno().to_le_bytes());
        for slot in &self.slots {
            contents.extend_from_slice(&slot.load(Ordering::Acquire).to_le_bytes());
        }

        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        info!(path = %path.display(), seqno = self.seqno(), "expected state saved");
        Ok(())
    }

    /// Load a snapshot, resolving pending bits conservatively.
    pub fn load(path: &Path) -> Result<Self, OracleError> {
        let mut file = File::open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if contents.len() < 36 {
            return Err(OracleError::Corruption(format!(
                "snapshot of {} bytes is shorter than its header",
                contents.len()
            )));
        }
        if contents[..8] != STATE_MAGIC {
            return Err(OracleError::Corruption("bad snapshot magic".into()));
        }
        let version = u32::from_le_bytes(contents[8..12].try_into().unwrap_or([0; 4]));
        if version != FORMAT_VERSION {
            return Err(OracleError::Corruption(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let num_cfs = u32::from_le_bytes(contents[12..16].try_into().unwrap_or([0; 4]));
        let max_key = u64::from_le_bytes(contents[16..24].try_into().unwrap_or([0; 8]));
        let log2_keys_per_lock =
            u32::from_le_bytes(contents[24..28].try_into().unwrap_or([0; 4]));
        let seqno = u64::from_le_bytes(contents[28..36].try_into().unwrap_or([0; 8]));

        let total = num_cfs as usize * max_key as usize;
        if contents.len() != 36 + total * 4 {
            return Err(OracleError::Corruption(format!(
                "snapshot holds {} bytes, expected {}",
                contents.len(),
                36 + total * 4
            )));
        }

        let mut slots = Vec::with_capacity(total);
        for i in 0..total {
            let at = 36 + i * 4;
            let raw = u32::from_le_bytes(contents[at..at + 4].try_into().unwrap_or([0; 4]));
            slots.push(AtomicU32::new(raw));
        }

        let state = Self {
            num_cfs,
            max_key,
            log2_keys_per_lock,
            slots,
            seqno: AtomicU64::new(seqno),
        };
        state.resolve_pending();
        debug!(path = %path.display(), seqno, "expected state loaded");
        Ok(state)
    }
}

/// Guard for an in-flight put; dropping without commit leaves the
/// pending bit set (resolved conservatively on the next load).
#[must_use = "commit once the database acknowledges the write"]
pub struct PendingPut<'a> {
    oracle: &'a ExpectedState,
    cf: u32,
    key: u64,
}

impl PendingPut<'_> {
    /// The database acknowledged the put.
    pub fn commit(self) {
        self.oracle.commit_put(self.cf, self.key);
    }
}

/// Guard for an in-flight delete; same drop semantics as [`PendingPut`].
#[must_use = "commit once the database acknowledges the delete"]
pub struct PendingDelete<'a> {
    oracle: &'a ExpectedState,
    cf: u32,
    key: u64,
}

impl PendingDelete<'_> {
    /// The database acknowledged the delete.
    pub fn commit(self) {
        self.oracle.commit_delete(self.cf, self.key);
    }
}

// ------------------------------------------------------------------------------------------------
// Key/value codec shared with the crash tests
// ------------------------------------------------------------------------------------------------

/// Database key bytes for oracle key `key` in `cf`.
pub fn key_bytes(cf: u32, key: u64) -> Vec<u8> {
    format!("{cf:02}:{key:016}").into_bytes()
}

/// Deterministic value bytes for `(key, value_base)`; parseable back via
/// [`parse_value_base`].
pub fn value_bytes(key: u64, value_base: u32) -> Vec<u8> {
    format!("{key:016x}/{value_base:08x}").into_bytes()
}

/// Recover the generation from value bytes produced by [`value_bytes`].
pub fn parse_value_base(value: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(value).ok()?;
    let (_, base) = text.split_once('/')?;
    u32::from_str_radix(base, 16).ok()
}

// ------------------------------------------------------------------------------------------------
// Trace files
// ------------------------------------------------------------------------------------------------

/// Trace operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceOp {
    /// A put of a new generation.
    Put = 1,
    /// A point delete.
    Delete = 2,
}

/// One fixed-size trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub op: TraceOp,
    pub cf: u8,
    pub key: u64,
    pub value_base: u32,
    pub seqno: u64,
}

/// Header of a trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    pub start_seq: u64,
    pub num_cfs: u32,
    pub max_key: u64,
}

/// Appends trace records as operations are issued.
pub struct TraceWriter {
    file: File,
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter").finish_non_exhaustive()
    }
}

impl TraceWriter {
    /// Create a trace at `path` with its header.
    pub fn create(path: &Path, header: TraceHeader) -> Result<Self, OracleError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&TRACE_MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&header.start_seq.to_le_bytes());
        buf.extend_from_slice(&header.num_cfs.to_le_bytes());
        buf.extend_from_slice(&header.max_key.to_le_bytes());
        file.write_all(&buf)?;
        Ok(Self { file })
    }

    /// Append one record.
    pub fn append(&mut self, record: TraceRecord) -> Result<(), OracleError> {
        let mut buf = [0u8; TRACE_RECORD_LEN];
        buf[0] = record.op as u8;
        buf[1] = record.cf;
        // bytes 2..4 are padding
        buf[4..12].copy_from_slice(&record.key.to_le_bytes());
        buf[12..16].copy_from_slice(&record.value_base.to_le_bytes());
        buf[16..24].copy_from_slice(&record.seqno.to_le_bytes());
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// fsync the trace file.
    pub fn sync(&mut self) -> Result<(), OracleError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Reads trace records back, tolerating a torn tail.
pub struct TraceReader {
    file: File,
    header: TraceHeader,
}

impl std::fmt::Debug for TraceReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceReader")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl TraceReader {
    /// Open a trace and validate its header.
    pub fn open(path: &Path) -> Result<Self, OracleError> {
        let mut file = File::open(path)?;
        let mut header_bytes = [0u8; 32];
        file.read_exact(&mut header_bytes)
            .map_err(|_| OracleError::Corruption("trace shorter than its header".into()))?;
        if header_bytes[..8] != TRACE_MAGIC {
            return Err(OracleError::Corruption("bad trace magic".into()));
        }
        let version = u32::from_le_bytes(header_bytes[8..12].try_into().unwrap_or([0; 4]));
        if version != FORMAT_VERSION {
            return Err(OracleError::Corruption(format!(
                "unsupported trace version {version}"
            )));
        }
        let header = TraceHeader {
            start_seq: u64::from_le_bytes(header_bytes[12..20].try_into().unwrap_or([0; 8])),
            num_cfs: u32::from_le_bytes(header_bytes[20..24].try_into().unwrap_or([0; 4])),
            max_key: u64::from_le_bytes(header_bytes[24..32].try_into().unwrap_or([0; 8])),
        };
        Ok(Self { file, header })
    }

    /// The trace header.
    pub fn header(&self) -> TraceHeader {
        self.header
    }

    /// Next record, or `None` at end-of-trace (including a torn tail).
    pub fn next_record(&mut self) -> Result<Option<TraceRecord>, OracleError> {
        let mut buf = [0u8; TRACE_RECORD_LEN];
        let mut filled = 0usize;
        while filled < TRACE_RECORD_LEN {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                if filled != 0 {
                    warn!(partial = filled, "trace ends in a torn record");
                }
                return Ok(None);
            }
            filled += n;
        }
        let op = match buf[0] {
            1 => TraceOp::Put,
            2 => TraceOp::Delete,
            other => {
                return Err(OracleError::Corruption(format!(
                    "unknown trace op {other}"
                )));
            }
        };
        Ok(Some(TraceRecord {
            op,
            cf: buf[1],
            key: u64::from_le_bytes(buf[4..12].try_into().unwrap_or([0; 8])),
            value_base: u32::from_le_bytes(buf[12..16].try_into().unwrap_or([0; 4])),
            seqno: u64::from_le_bytes(buf[16..24].try_into().unwrap_or([0; 8])),
        }))
    }
}

/// Replay trace records with `seqno ≤ upto_seqno` onto `state`.
///
/// Records above the bound are exactly the writes a crash destroyed;
/// stopping there reproduces the durable expected state.
pub fn replay_trace(
    state: &ExpectedState,
    reader: &mut TraceReader,
    upto_seqno: u64,
) -> Result<u64, OracleError> {
    let mut applied = 0u64;
    while let Some(record) = reader.next_record()? {
        if record.seqno > upto_seqno {
            break;
        }
        match record.op {
            TraceOp::Put => {
                state
                    .begin_put(u32::from(record.cf), record.key, record.value_base)
                    .commit();
            }
            TraceOp::Delete => {
                state.begin_delete(u32::from(record.cf), record.key).commit();
            }
        }
        applied += 1;
    }
    state.set_seqno(upto_seqno);
    debug!(applied, upto_seqno, "trace replayed");
    Ok(applied)
}
