//! Prefix-compressed blocks — the unit shared by data, index, and
//! metaindex sections of a table file.
//!
//! # Layout
//!
//! ```text
//! entry*            [shared varint][non_shared varint][value_len varint]
//!                   [key_delta (non_shared bytes)][value (value_len bytes)]
//! restarts          [restart_offset u32 LE]*
//! num_restarts      u32 LE
//! ```
//!
//! Every `restart_interval`-th entry stores its key uncompressed and is
//! recorded as a restart point; entries in between share a prefix with
//! their predecessor. Lookups binary-search the restart array, then scan
//! forward.
//!
//! Keys inside a block are ordered by the block's comparator: the
//! internal-key comparator for data and index blocks, plain byte order
//! for metaindex blocks.

use std::cmp::Ordering;

use crate::encoding::{get_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::keys;

use super::SstError;

/// Default number of entries between restart points.
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

/// How keys inside a block are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockComparator {
    /// The database comparator (user key ascending, tag descending).
    InternalKey,
    /// Plain byte order; used for metaindex blocks.
    Bytewise,
}

impl BlockComparator {
    fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::InternalKey => keys::compare_encoded(a, b),
            Self::Bytewise => a.cmp(b),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// BlockBuilder
// ------------------------------------------------------------------------------------------------

/// Accumulates ordered entries into a serialized block.
#[derive(Debug)]
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    entries_since_restart: usize,
    last_key: Vec<u8>,
    num_entries: usize,
}

impl BlockBuilder {
    /// A fresh builder with the given restart interval.
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            restart_interval: restart_interval.max(1),
            entries_since_restart: 0,
            last_key: Vec::new(),
            num_entries: 0,
        }
    }

    /// Append an entry. The caller guarantees keys arrive in block order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entries_since_restart < self.restart_interval {
            shared_prefix_len(&self.last_key, key)
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.entries_since_restart = 0;
            0
        };
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entries_since_restart += 1;
        self.num_entries += 1;
    }

    /// Serialized size if `finish` were called now.
    pub fn current_size(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Whether no entries have been added.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Number of entries added.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Seal the block and return its serialized contents.
    pub fn finish(mut self) -> Vec<u8> {
        for restart in &self.restarts {
            put_fixed32(&mut self.buffer, *restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.buffer
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

// ------------------------------------------------------------------------------------------------
// Block (read side)
// ------------------------------------------------------------------------------------------------

/// A parsed, immutable block.
#[derive(Debug, Clone)]
pub struct Block {
    contents: Vec<u8>,
    /// Offset of the restart array inside `contents`.
    restarts_offset: usize,
    num_restarts: usize,
    comparator: BlockComparator,
}

impl Block {
    /// Parse serialized block contents (without the file-level trailer).
    pub fn parse(contents: Vec<u8>, comparator: BlockComparator) -> Result<Self, SstError> {
        if contents.len() < 4 {
            return Err(SstError::Corruption(
                "block too small for restart count".into(),
            ));
        }
        let (num_restarts, _) = get_fixed32(&contents[contents.len() - 4..])?;
        let num_restarts = num_restarts as usize;
        let restarts_len = num_restarts
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| SstError::Corruption("restart count overflows".into()))?;
        if num_restarts == 0 || restarts_len > contents.len() {
            return Err(SstError::Corruption(format!(
                "restart array ({num_restarts} entries) does not fit block of {} bytes",
                contents.len()
            )));
        }
        let restarts_offset = contents.len() - restarts_len;
        Ok(Self {
            contents,
            restarts_offset,
            num_restarts,
            comparator,
        })
    }

    fn restart_point(&self, index: usize) -> Result<usize, SstError> {
        let at = self.restarts_offset + index * 4;
        let (offset, _) = get_fixed32(&self.contents[at..])?;
        let offset = offset as usize;
        if offset >= self.restarts_offset {
            return Err(SstError::Corruption(format!(
                "restart point {offset} beyond entry data"
            )));
        }
        Ok(offset)
    }

    /// Iterator positioned before the first entry.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            pos: 0,
            current_key: Vec::new(),
            exhausted: false,
        }
    }

    /// Iterator positioned at the first entry with key ≥ `target`.
    pub fn iter_seek(&self, target: &[u8]) -> Result<BlockIter<'_>, SstError> {
        if self.restarts_offset == 0 {
            // No entries at all.
            return Ok(self.iter());
        }
        // Binary search the restart array for the last restart whose key
        // is < target, then scan forward.
        let mut left = 0usize;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let offset = self.restart_point(mid)?;
            let (key, _, _) = self.decode_entry(offset, &[])?;
            if self.comparator.compare(&key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        let mut iter = BlockIter {
            block: self,
            pos: self.restart_point(left)?,
            current_key: Vec::new(),
            exhausted: false,
        };
        // Scan forward to the first entry ≥ target.
        loop {
            let Some(entry) = iter.peek()? else {
                break;
            };
            if self.comparator.compare(&entry.0, target) != Ordering::Less {
                break;
            }
            iter.advance()?;
        }
        Ok(iter)
    }

    /// Decode the entry at `offset`, given the previous key for prefix
    /// reconstruction. Returns `(key, value, next_offset)`.
    fn decode_entry(
        &self,
        offset: usize,
        prev_key: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>, usize), SstError> {
        let data = &self.contents[..self.restarts_offset];
        let mut pos = offset;

        let (shared, n) = get_varint32(&data[pos..])?;
        pos += n;
        let (non_shared, n) = get_varint32(&data[pos..])?;
        pos += n;
        let (value_len, n) = get_varint32(&data[pos..])?;
        pos += n;

        let shared = shared as usize;
        let non_shared = non_shared as usize;
        let value_len = value_len as usize;

        if shared > prev_key.len() {
            return Err(SstError::Corruption(format!(
                "entry shares {shared} bytes but previous key has {}",
                prev_key.len()
            )));
        }
        if pos + non_shared + value_len > data.len() {
            return Err(SstError::Corruption(
                "block entry overruns entry data".into(),
            ));
        }

        let mut key = Vec::with_capacity(shared + non_shared);
        key.extend_from_slice(&prev_key[..shared]);
        key.extend_from_slice(&data[pos..pos + non_shared]);
        pos += non_shared;
        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        Ok((key, value, pos))
    }
}

// ------------------------------------------------------------------------------------------------
// BlockIter
// ------------------------------------------------------------------------------------------------

/// Forward iterator over one block's entries.
#[derive(Debug)]
pub struct BlockIter<'a> {
    block: &'a Block,
    pos: usize,
    current_key: Vec<u8>,
    exhausted: bool,
}

impl BlockIter<'_> {
    /// Decode the entry at the cursor without consuming it.
    fn peek(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SstError> {
        if self.exhausted || self.pos >= self.block.restarts_offset {
            return Ok(None);
        }
        let (key, value, _) = self.block.decode_entry(self.pos, &self.current_key)?;
        Ok(Some((key, value)))
    }

    fn advance(&mut self) -> Result<(), SstError> {
        let (key, _, next) = self.block.decode_entry(self.pos, &self.current_key)?;
        self.current_key = key;
        self.pos = next;
        Ok(())
    }

    /// Consume and return the next entry.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SstError> {
        if self.exhausted || self.pos >= self.block.restarts_offset {
            self.exhausted = true;
            return Ok(None);
        }
        let (key, value, next) = self.block.decode_entry(self.pos, &self.current_key)?;
        self.current_key = key.clone();
        self.pos = next;
        Ok(Some((key, value)))
    }
}

// ------------------------------------------------------------------------------------------------
// OwnedBlockIter
// ------------------------------------------------------------------------------------------------

/// Forward iterator that owns its block; used where the block cannot be
/// borrowed (streaming table scans).
#[derive(Debug)]
pub struct OwnedBlockIter {
    block: Block,
    pos: usize,
    current_key: Vec<u8>,
    exhausted: bool,
}

impl OwnedBlockIter {
    /// Iterator over all of `block`, positioned at the first entry.
    pub fn new(block: Block) -> Self {
        Self {
            block,
            pos: 0,
            current_key: Vec::new(),
            exhausted: false,
        }
    }

    /// Consume and return the next entry.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SstError> {
        if self.exhausted || self.pos >= self.block.restarts_offset {
            self.exhausted = true;
            return Ok(None);
        }
        let (key, value, next) = self.block.decode_entry(self.pos, &self.current_key)?;
        self.current_key = key.clone();
        self.pos = next;
        Ok(Some((key, value)))
    }
}
