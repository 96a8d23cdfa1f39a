//! Write batches — the unit of atomicity on the write path.
//!
//! A batch is the serialized payload of one WAL record:
//!
//! ```text
//! [sequence (8, LE)][count (4, LE)][record]*
//! record = [kind (1)][key_len varint][key]([value_len varint][value])?
//! ```
//!
//! `Put` and `RangeDeletion` records carry a value (`RangeDeletion`
//! stores the exclusive end key in the value position); `Deletion`
//! records carry only the key. The records in a batch receive
//! consecutive sequence numbers starting at the batch sequence, and are
//! recovered all-or-nothing: a torn WAL record drops the whole batch.

use thiserror::Error;

use crate::encoding::{
    self, EncodingError, get_length_prefixed_slice,
};
use crate::keys::{SequenceNumber, ValueKind};

/// Fixed prefix: sequence (8) + count (4).
pub const BATCH_HEADER_LEN: usize = 12;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while decoding a serialized batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The payload is malformed.
    #[error("malformed write batch: {0}")]
    Malformed(String),

    /// A primitive inside the payload failed to decode.
    #[error("encoding error in write batch: {0}")]
    Encoding(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// Batch operations
// ------------------------------------------------------------------------------------------------

/// One decoded operation from a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key` with `value`.
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Point-delete `key`.
    Delete { key: Vec<u8> },

    /// Delete every key in `[start, end)`.
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
}

// ------------------------------------------------------------------------------------------------
// WriteBatch
// ------------------------------------------------------------------------------------------------

/// An ordered set of updates applied (and made durable) atomically.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    /// An empty batch with a zero sequence.
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_LEN],
        }
    }

    /// Queue an insert of `key` → `value`. Empty keys and values are
    /// valid.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.rep.push(ValueKind::Value as u8);
        encoding::put_length_prefixed_slice(&mut self.rep, key);
        encoding::put_length_prefixed_slice(&mut self.rep, value);
        self.bump_count();
    }

    /// Queue a point deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.rep.push(ValueKind::Deletion as u8);
        encoding::put_length_prefixed_slice(&mut self.rep, key);
        self.bump_count();
    }

    /// Queue a range deletion of `[start, end)`.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        self.rep.push(ValueKind::RangeDeletion as u8);
        encoding::put_length_prefixed_slice(&mut self.rep, start);
        encoding::put_length_prefixed_slice(&mut self.rep, end);
        self.bump_count();
    }

    /// Number of queued operations.
    pub fn count(&self) -> u32 {
        u32::from_le_bytes([self.rep[8], self.rep[9], self.rep[10], self.rep[11]])
    }

    /// The base sequence number stamped on this batch.
    pub fn sequence(&self) -> SequenceNumber {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.rep[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Stamp the base sequence; records take `sequence .. sequence+count`.
    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Serialized size in bytes.
    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    /// Whether any operations are queued.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Drop all queued operations, keeping the allocation.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_LEN, 0);
    }

    /// The serialized payload written to the WAL.
    pub fn encoded(&self) -> &[u8] {
        &self.rep
    }

    /// Adopt a serialized payload (e.g. replayed from the WAL),
    /// validating its structure.
    pub fn from_encoded(rep: Vec<u8>) -> Result<Self, BatchError> {
        if rep.len() < BATCH_HEADER_LEN {
            return Err(BatchError::Malformed(format!(
                "payload of {} bytes is shorter than the header",
                rep.len()
            )));
        }
        let batch = Self { rep };
        // Full decode validates record framing and the count field.
        let decoded = batch.ops()?;
        if decoded.len() as u32 != batch.count() {
            return Err(BatchError::Malformed(format!(
                "count field says {} records, payload holds {}",
                batch.count(),
                decoded.len()
            )));
        }
        Ok(batch)
    }

    /// Decode the queued operations in order.
    pub fn ops(&self) -> Result<Vec<BatchOp>, BatchError> {
        let mut ops = Vec::with_capacity(self.count() as usize);
        let mut cursor = &self.rep[BATCH_HEADER_LEN..];
        while !cursor.is_empty() {
            let kind = ValueKind::from_u8(cursor[0]).ok_or_else(|| {
                BatchError::Malformed(format!("unknown record kind {}", cursor[0]))
            })?;
            cursor = &cursor[1..];
            let (key, n) = get_length_prefixed_slice(cursor)?;
            cursor = &cursor[n..];
            let op = match kind {
                ValueKind::Value => {
                    let (value, n) = get_length_prefixed_slice(cursor)?;
                    cursor = &cursor[n..];
                    BatchOp::Put { key, value }
                }
                ValueKind::Deletion => BatchOp::Delete { key },
                ValueKind::RangeDeletion => {
                    let (end, n) = get_length_prefixed_slice(cursor)?;
                    cursor = &cursor[n..];
                    BatchOp::DeleteRange { start: key, end }
                }
            };
            ops.push(op);
        }
        Ok(ops)
    }

    /// The sequence number one past the last record of this batch.
    pub fn end_sequence(&self) -> SequenceNumber {
        self.sequence() + u64::from(self.count())
    }

    fn bump_count(&mut self) {
        let count = self.count() + 1;
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
