//! Sorted table (SST) files — immutable, block-structured on-disk tables.
//!
//! ## Design overview
//!
//! A table stores internal-keyed records in prefix-compressed data
//! blocks, fronted by a bloom filter for point lookups and a block index
//! for range addressing. Tables are written once by [`TableBuilder`] and
//! never modified; readers ([`Table`]) are immutable and shared freely
//! across threads.
//!
//! # On-disk layout
//!
//! ```text
//! [data block][trailer]            repeated; trailer = [compression u8][crc32c u32 LE]
//! [filter block][trailer]          serialized bloom filter over user keys
//! [range-del block][trailer]       optional; serialized range tombstones
//! [properties block][trailer]      entry/tombstone counts, sequence bounds
//! [metaindex block][trailer]       name → handle for the meta blocks
//! [index block][trailer]           last key of each data block → handle
//! [footer (48 bytes)]              checksum kind, metaindex/index handles,
//!                                  zero padding, 8-byte magic
//! ```
//!
//! Block handles are `(varint64 offset, varint64 size)` pairs; handle
//! sizes exclude the 5-byte trailer. The trailer checksum is CRC32C over
//! the block contents followed by the compression byte.
//!
//! # Guarantees
//!
//! - Keys within a table are strictly increasing in internal-key order
//!   (user key ascending, sequence descending on ties).
//! - Every block checksum is verified on read; a mismatch surfaces as
//!   [`SstError::Corruption`], never as silent data.
//! - The footer magic and checksum kind are validated before anything
//!   else is trusted.

pub mod block;
mod builder;
mod filter;

#[cfg(test)]
mod tests;

pub use builder::TableBuilder;
pub use filter::TableFilter;

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::encoding::{
    self, EncodingError, get_varint64, put_varint64,
};
use crate::keys::{self, InternalKey, SequenceNumber, ValueKind};
use crate::memtable::RangeTombstone;
use crate::vfs::RandomAccessFile;

use block::{Block, BlockComparator};

/// Fixed footer length at the end of every table file.
pub const FOOTER_LEN: usize = 48;

/// Footer magic, stored as the final 8 bytes of the file.
pub const TABLE_MAGIC: [u8; 8] = *b"RKYDSST1";

/// The only checksum kind this format version defines (CRC32C).
pub const CHECKSUM_KIND_CRC32C: u8 = 1;

/// Compression byte for uncompressed blocks (the only supported form).
pub const COMPRESSION_NONE: u8 = 0;

/// Trailer appended to every block: compression byte + CRC32C.
pub const BLOCK_TRAILER_LEN: usize = 5;

/// Metaindex entry names.
pub const META_FILTER: &[u8] = b"filter.bloom";
pub const META_PROPERTIES: &[u8] = b"meta.properties";
pub const META_RANGE_DEL: &[u8] = b"meta.range-del";

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table building and reading.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch, malformed structure, or an invariant violation
    /// inside the file.
    #[error("table corruption: {0}")]
    Corruption(String),

    /// A primitive failed to decode (reported as corruption upstream).
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The caller violated the builder contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Block handle
// ------------------------------------------------------------------------------------------------

/// Location of a block inside the table file. `size` excludes the
/// 5-byte trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    /// Append the varint64 pair.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        put_varint64(buf, self.offset);
        put_varint64(buf, self.size);
    }

    /// Decode a handle, returning `(handle, bytes_consumed)`.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize), SstError> {
        let (offset, n) = get_varint64(buf)?;
        let (size, m) = get_varint64(&buf[n..])?;
        Ok((Self { offset, size }, n + m))
    }
}

// ------------------------------------------------------------------------------------------------
// Properties
// ------------------------------------------------------------------------------------------------

/// Table-level statistics stored in the properties meta-block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableProperties {
    /// Point entries in the table.
    pub num_entries: u64,
    /// Range tombstones in the table.
    pub num_range_tombstones: u64,
    /// Smallest sequence number of any record.
    pub smallest_seqno: SequenceNumber,
    /// Largest sequence number of any record.
    pub largest_seqno: SequenceNumber,
}

impl TableProperties {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint64(&mut buf, self.num_entries);
        put_varint64(&mut buf, self.num_range_tombstones);
        put_varint64(&mut buf, self.smallest_seqno);
        put_varint64(&mut buf, self.largest_seqno);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, SstError> {
        let (num_entries, mut pos) = get_varint64(buf)?;
        let (num_range_tombstones, n) = get_varint64(&buf[pos..])?;
        pos += n;
        let (smallest_seqno, n) = get_varint64(&buf[pos..])?;
        pos += n;
        let (largest_seqno, _) = get_varint64(&buf[pos..])?;
        Ok(Self {
            num_entries,
            num_range_tombstones,
            smallest_seqno,
            largest_seqno,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_LEN);
        buf.push(CHECKSUM_KIND_CRC32C);
        self.metaindex.encode_to(&mut buf);
        self.index.encode_to(&mut buf);
        buf.resize(FOOTER_LEN - TABLE_MAGIC.len(), 0);
        buf.extend_from_slice(&TABLE_MAGIC);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SstError> {
        if buf.len() != FOOTER_LEN {
            return Err(SstError::Corruption(format!(
                "footer must be {FOOTER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        if buf[FOOTER_LEN - TABLE_MAGIC.len()..] != TABLE_MAGIC {
            return Err(SstError::Corruption("bad table magic".into()));
        }
        if buf[0] != CHECKSUM_KIND_CRC32C {
            return Err(SstError::Corruption(format!(
                "unknown checksum kind {}",
                buf[0]
            )));
        }
        let (metaindex, n) = BlockHandle::decode_from(&buf[1..])?;
        let (index, _) = BlockHandle::decode_from(&buf[1 + n..])?;
        Ok(Self { metaindex, index })
    }
}

// ------------------------------------------------------------------------------------------------
// Range tombstone block coding
// ------------------------------------------------------------------------------------------------

fn encode_range_tombstones(tombstones: &[RangeTombstone]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_varint64(&mut buf, tombstones.len() as u64);
    for tombstone in tombstones {
        encoding::put_length_prefixed_slice(&mut buf, &tombstone.start);
        encoding::put_length_prefixed_slice(&mut buf, &tombstone.end);
        put_varint64(&mut buf, tombstone.sequence);
    }
    buf
}

fn decode_range_tombstones(buf: &[u8]) -> Result<Vec<RangeTombstone>, SstError> {
    let (count, mut pos) = get_varint64(buf)?;
    let mut tombstones = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let (start, n) = encoding::get_length_prefixed_slice(&buf[pos..])?;
        pos += n;
        let (end, n) = encoding::get_length_prefixed_slice(&buf[pos..])?;
        pos += n;
        let (sequence, n) = get_varint64(&buf[pos..])?;
        pos += n;
        tombstones.push(RangeTombstone {
            start,
            end,
            sequence,
        });
    }
    Ok(tombstones)
}

// ------------------------------------------------------------------------------------------------
// Table reader
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup inside one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableGet {
    /// Sequence of the record found.
    pub sequence: SequenceNumber,
    /// Record kind ([`ValueKind::Value`] or [`ValueKind::Deletion`]).
    pub kind: ValueKind,
    /// The value bytes (empty for deletions).
    pub value: Vec<u8>,
}

/// An open, immutable table file.
pub struct Table {
    file: Arc<dyn RandomAccessFile>,
    file_size: u64,
    index: Block,
    filter: Option<TableFilter>,
    range_tombstones: Vec<RangeTombstone>,
    properties: TableProperties,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("file_size", &self.file_size)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Open a table: validate the footer, load the index and meta blocks.
    pub fn open(file: Arc<dyn RandomAccessFile>, file_size: u64) -> Result<Self, SstError> {
        if file_size < FOOTER_LEN as u64 {
            return Err(SstError::Corruption(format!(
                "table of {file_size} bytes cannot hold a footer"
            )));
        }
        let footer_bytes = file.read_at(file_size - FOOTER_LEN as u64, FOOTER_LEN)?;
        let footer = Footer::decode(&footer_bytes)?;

        let index_contents = read_block(&*file, file_size, footer.index)?;
        let index = Block::parse(index_contents, BlockComparator::InternalKey)?;

        let metaindex_contents = read_block(&*file, file_size, footer.metaindex)?;
        let metaindex = Block::parse(metaindex_contents, BlockComparator::Bytewise)?;

        let mut filter = None;
        let mut properties = TableProperties::default();
        let mut range_tombstones = Vec::new();

        let mut meta_iter = metaindex.iter();
        while let Some((name, handle_bytes)) = meta_iter.next_entry()? {
            let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
            match name.as_slice() {
                name if name == META_FILTER => {
                    let contents = read_block(&*file, file_size, handle)?;
                    filter = Some(TableFilter::from_bytes(&contents)?);
                }
                name if name == META_PROPERTIES => {
                    let contents = read_block(&*file, file_size, handle)?;
                    properties = TableProperties::decode(&contents)?;
                }
                name if name == META_RANGE_DEL => {
                    let contents = read_block(&*file, file_size, handle)?;
                    range_tombstones = decode_range_tombstones(&contents)?;
                }
                other => {
                    debug!(name = ?String::from_utf8_lossy(other), "ignoring unknown meta block");
                }
            }
        }

        Ok(Self {
            file,
            file_size,
            index,
            filter,
            range_tombstones,
            properties,
        })
    }

    /// Table-level statistics.
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// Range tombstones stored in this table.
    pub fn range_tombstones(&self) -> &[RangeTombstone] {
        &self.range_tombstones
    }

    /// Highest range-tombstone sequence ≤ `snapshot` covering `user_key`.
    pub fn max_covering_tombstone(
        &self,
        user_key: &[u8],
        snapshot: SequenceNumber,
    ) -> Option<SequenceNumber> {
        self.range_tombstones
            .iter()
            .filter(|t| t.sequence <= snapshot && t.covers(user_key))
            .map(|t| t.sequence)
            .max()
    }

    /// Find the newest point record for `user_key` with sequence ≤
    /// `snapshot`.
    ///
    /// Range tombstones are *not* applied here; the caller merges
    /// tombstones across all sources (see
    /// [`max_covering_tombstone`](Self::max_covering_tombstone)).
    pub fn get(
        &self,
        user_key: &[u8],
        snapshot: SequenceNumber,
    ) -> Result<Option<TableGet>, SstError> {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(user_key) {
                trace!(key = %keys::DisplayBytes(user_key), "bloom filter negative");
                return Ok(None);
            }
        }

        let lookup = InternalKey::for_lookup(user_key, snapshot);
        let mut index_iter = self.index.iter_seek(lookup.encoded())?;
        let Some((_, handle_bytes)) = index_iter.next_entry()? else {
            return Ok(None);
        };
        let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
        let contents = read_block(&*self.file, self.file_size, handle)?;
        let data = Block::parse(contents, BlockComparator::InternalKey)?;

        let mut data_iter = data.iter_seek(lookup.encoded())?;
        let Some((key_bytes, value)) = data_iter.next_entry()? else {
            return Ok(None);
        };
        let Some(key) = InternalKey::from_encoded(key_bytes) else {
            return Err(SstError::Corruption("undecodable internal key".into()));
        };
        if key.user_key() != user_key {
            return Ok(None);
        }
        Ok(Some(TableGet {
            sequence: key.sequence(),
            kind: key.kind(),
            value,
        }))
    }

    /// Iterate every point entry in internal-key order.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            table: self,
            index_iter: self.index.iter(),
            data: None,
            done: false,
        }
    }
}

impl Table {
    fn load_data_block(&self, handle: BlockHandle) -> Result<Block, SstError> {
        let contents = read_block(&*self.file, self.file_size, handle)?;
        Block::parse(contents, BlockComparator::InternalKey)
    }
}

/// Read and verify one block given its handle.
fn read_block(
    file: &dyn RandomAccessFile,
    file_size: u64,
    handle: BlockHandle,
) -> Result<Vec<u8>, SstError> {
    let total = handle.size as usize + BLOCK_TRAILER_LEN;
    if handle.offset + total as u64 > file_size {
        return Err(SstError::Corruption(format!(
            "block handle ({}, {}) overruns file of {file_size} bytes",
            handle.offset, handle.size
        )));
    }
    let raw = file.read_at(handle.offset, total)?;
    if raw.len() != total {
        return Err(SstError::Corruption(format!(
            "short block read: wanted {total} bytes, got {}",
            raw.len()
        )));
    }
    let contents = &raw[..handle.size as usize];
    let compression = raw[handle.size as usize];
    let stored_crc = u32::from_le_bytes([
        raw[handle.size as usize + 1],
        raw[handle.size as usize + 2],
        raw[handle.size as usize + 3],
        raw[handle.size as usize + 4],
    ]);
    let computed = crc32c::crc32c_append(crc32c::crc32c(contents), &[compression]);
    if computed != stored_crc {
        return Err(SstError::Corruption(format!(
            "block checksum mismatch at offset {}",
            handle.offset
        )));
    }
    if compression != COMPRESSION_NONE {
        return Err(SstError::Corruption(format!(
            "unsupported compression byte {compression}"
        )));
    }
    Ok(contents.to_vec())
}

/// Append block contents + trailer, returning the handle.
pub(crate) fn block_trailer(contents: &[u8]) -> [u8; BLOCK_TRAILER_LEN] {
    let crc = crc32c::crc32c_append(crc32c::crc32c(contents), &[COMPRESSION_NONE]);
    let mut trailer = [0u8; BLOCK_TRAILER_LEN];
    trailer[0] = COMPRESSION_NONE;
    trailer[1..].copy_from_slice(&crc.to_le_bytes());
    trailer
}

// ------------------------------------------------------------------------------------------------
// TableIter
// ------------------------------------------------------------------------------------------------

/// Two-level iterator: walks the index, streaming each data block.
pub struct TableIter<'a> {
    table: &'a Table,
    index_iter: block::BlockIter<'a>,
    data: Option<block::OwnedBlockIter>,
    done: bool,
}

impl TableIter<'_> {
    /// Next entry, or `None` at the end of the table.
    pub fn next_entry(&mut self) -> Result<Option<(InternalKey, Vec<u8>)>, SstError> {
        if self.done {
            return Ok(None);
        }
        loop {
            if let Some(data_iter) = &mut self.data {
                if let Some((key_bytes, value)) = data_iter.next_entry()? {
                    let Some(key) = InternalKey::from_encoded(key_bytes) else {
                        return Err(SstError::Corruption("undecodable internal key".into()));
                    };
                    return Ok(Some((key, value)));
                }
                self.data = None;
            }
            let Some((_, handle_bytes)) = self.index_iter.next_entry()? else {
                self.done = true;
                return Ok(None);
            };
            let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
            let block = self.table.load_data_block(handle)?;
            self.data = Some(block::OwnedBlockIter::new(block));
        }
    }
}
