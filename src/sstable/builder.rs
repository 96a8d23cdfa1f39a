//! Table builder — writes a complete table file from an ordered record
//! stream.
//!
//! # Contract
//!
//! - [`TableBuilder::add`] requires internal keys in strictly
//!   non-decreasing comparator order; an out-of-order key is rejected
//!   before anything is written.
//! - [`TableBuilder::add_range_tombstones`] may be called any time before
//!   `finish`.
//! - [`TableBuilder::finish`] writes the meta blocks, index, and footer,
//!   and returns the footer offset. The file is **not** synced or closed;
//!   the owning job orders `sync`/`close` around its own crash points.
//! - [`TableBuilder::abandon`] marks the builder dead on error paths so a
//!   later `finish` cannot emit a half-built table.

use tracing::{debug, trace};

use crate::keys::{self, InternalKey, SequenceNumber};
use crate::memtable::RangeTombstone;
use crate::vfs::WritableFile;

use super::block::{BlockBuilder, DEFAULT_RESTART_INTERVAL};
use super::filter::TableFilter;
use super::{
    BlockHandle, Footer, META_FILTER, META_PROPERTIES, META_RANGE_DEL, SstError,
    TableProperties, block_trailer, encode_range_tombstones,
};

/// Default data-block payload target (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Streaming writer for one table file.
pub struct TableBuilder {
    file: Box<dyn WritableFile>,
    block_size: usize,
    restart_interval: usize,

    data_block: BlockBuilder,
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    /// Distinct user keys seen, for bloom construction at finish time.
    filter_keys: Vec<Vec<u8>>,
    range_tombstones: Vec<RangeTombstone>,

    last_key: Option<Vec<u8>>,
    num_entries: u64,
    smallest_seqno: SequenceNumber,
    largest_seqno: SequenceNumber,
    offset: u64,
    state: BuilderState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderState {
    Building,
    Finished,
    Abandoned,
}

impl std::fmt::Debug for TableBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableBuilder")
            .field("num_entries", &self.num_entries)
            .field("offset", &self.offset)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TableBuilder {
    /// Start building into `file` with default block parameters.
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self::with_params(file, DEFAULT_BLOCK_SIZE, DEFAULT_RESTART_INTERVAL)
    }

    /// Start building with explicit block size and restart interval.
    pub fn with_params(
        file: Box<dyn WritableFile>,
        block_size: usize,
        restart_interval: usize,
    ) -> Self {
        Self {
            file,
            block_size: block_size.max(128),
            restart_interval,
            data_block: BlockBuilder::new(restart_interval),
            index_entries: Vec::new(),
            filter_keys: Vec::new(),
            range_tombstones: Vec::new(),
            last_key: None,
            num_entries: 0,
            smallest_seqno: u64::MAX,
            largest_seqno: 0,
            offset: 0,
            state: BuilderState::Building,
        }
    }

    /// Append one point record. Keys must arrive in comparator order.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<(), SstError> {
        self.check_building()?;
        if let Some(last) = &self.last_key {
            if keys::compare_encoded(key.encoded(), last) == std::cmp::Ordering::Less {
                return Err(SstError::InvalidArgument(format!(
                    "keys added out of order: {key:?} after a later key"
                )));
            }
        }

        if self
            .filter_keys
            .last()
            .is_none_or(|prev| prev.as_slice() != key.user_key())
        {
            self.filter_keys.push(key.user_key().to_vec());
        }

        self.data_block.add(key.encoded(), value);
        self.last_key = Some(key.encoded().to_vec());
        self.num_entries += 1;
        self.smallest_seqno = self.smallest_seqno.min(key.sequence());
        self.largest_seqno = self.largest_seqno.max(key.sequence());
        trace!(key = ?key, value_len = value.len(), "table add");

        if self.data_block.current_size() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Attach range tombstones; they land in the range-del meta block.
    pub fn add_range_tombstones(&mut self, tombstones: &[RangeTombstone]) -> Result<(), SstError> {
        self.check_building()?;
        for tombstone in tombstones {
            self.smallest_seqno = self.smallest_seqno.min(tombstone.sequence);
            self.largest_seqno = self.largest_seqno.max(tombstone.sequence);
        }
        self.range_tombstones.extend_from_slice(tombstones);
        Ok(())
    }

    /// Point records added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Range tombstones attached so far.
    pub fn num_range_tombstones(&self) -> u64 {
        self.range_tombstones.len() as u64
    }

    /// Bytes written to the file so far.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// Smallest and largest sequence numbers of the records added.
    pub fn sequence_bounds(&self) -> (SequenceNumber, SequenceNumber) {
        if self.num_entries == 0 && self.range_tombstones.is_empty() {
            (0, 0)
        } else {
            (self.smallest_seqno, self.largest_seqno)
        }
    }

    /// Mark the builder unusable; the partial file is the caller's to
    /// delete.
    pub fn abandon(&mut self) {
        self.state = BuilderState::Abandoned;
    }

    /// Write filter, range-del, properties, metaindex, index blocks and
    /// the footer. Returns the footer offset.
    pub fn finish(&mut self) -> Result<u64, SstError> {
        self.check_building()?;
        if self.num_entries == 0 && self.range_tombstones.is_empty() {
            return Err(SstError::InvalidArgument(
                "refusing to finish an empty table".into(),
            ));
        }
        if !self.data_block.is_empty() {
            self.flush_data_block()?;
        }

        // Filter block.
        let filter = TableFilter::build(&self.filter_keys)?;
        let filter_handle = self.write_raw_block(&filter.to_bytes())?;

        // Range-del block (only when tombstones exist).
        let range_del_handle = if self.range_tombstones.is_empty() {
            None
        } else {
            let mut tombstones = std::mem::take(&mut self.range_tombstones);
            tombstones.sort_by(|a, b| a.start.cmp(&b.start).then(b.sequence.cmp(&a.sequence)));
            let handle = self.write_raw_block(&encode_range_tombstones(&tombstones))?;
            self.range_tombstones = tombstones;
            Some(handle)
        };

        // Properties block.
        let properties = TableProperties {
            num_entries: self.num_entries,
            num_range_tombstones: self.range_tombstones.len() as u64,
            smallest_seqno: if self.smallest_seqno == u64::MAX {
                0
            } else {
                self.smallest_seqno
            },
            largest_seqno: self.largest_seqno,
        };
        let properties_handle = self.write_raw_block(&properties.encode())?;

        // Metaindex block (bytewise key order: "filter.bloom",
        // "meta.properties", "meta.range-del").
        let mut metaindex = BlockBuilder::new(self.restart_interval);
        let mut handle_buf = Vec::new();
        filter_handle.encode_to(&mut handle_buf);
        metaindex.add(META_FILTER, &handle_buf);
        handle_buf.clear();
        properties_handle.encode_to(&mut handle_buf);
        metaindex.add(META_PROPERTIES, &handle_buf);
        if let Some(handle) = range_del_handle {
            handle_buf.clear();
            handle.encode_to(&mut handle_buf);
            metaindex.add(META_RANGE_DEL, &handle_buf);
        }
        let metaindex_handle = self.write_raw_block(&metaindex.finish())?;

        // Index block.
        let mut index = BlockBuilder::new(self.restart_interval);
        for (last_key, handle) in &self.index_entries {
            handle_buf.clear();
            handle.encode_to(&mut handle_buf);
            index.add(last_key, &handle_buf);
        }
        let index_handle = self.write_raw_block(&index.finish())?;

        // Footer.
        let footer_offset = self.offset;
        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
        };
        self.file.append(&footer.encode())?;
        self.offset += super::FOOTER_LEN as u64;
        self.file.flush()?;

        self.state = BuilderState::Finished;
        debug!(
            entries = self.num_entries,
            range_tombstones = self.range_tombstones.len(),
            file_size = self.offset,
            "table finished"
        );
        Ok(footer_offset)
    }

    /// fsync the table file (valid after `finish`).
    pub fn sync(&mut self) -> Result<(), SstError> {
        self.file.sync()?;
        Ok(())
    }

    /// Close the table file handle.
    pub fn close(&mut self) -> Result<(), SstError> {
        self.file.close()?;
        Ok(())
    }

    // --------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------

    fn check_building(&self) -> Result<(), SstError> {
        match self.state {
            BuilderState::Building => Ok(()),
            BuilderState::Finished => Err(SstError::InvalidArgument(
                "builder already finished".into(),
            )),
            BuilderState::Abandoned => Err(SstError::InvalidArgument(
                "builder was abandoned".into(),
            )),
        }
    }

    fn flush_data_block(&mut self) -> Result<(), SstError> {
        let block = std::mem::replace(&mut self.data_block, BlockBuilder::new(self.restart_interval));
        let contents = block.finish();
        let handle = self.write_raw_block(&contents)?;
        let last_key = self
            .last_key
            .clone()
            .ok_or_else(|| SstError::InvalidArgument("flushing an empty data block".into()))?;
        self.index_entries.push((last_key, handle));
        Ok(())
    }

    fn write_raw_block(&mut self, contents: &[u8]) -> Result<BlockHandle, SstError> {
        let handle = BlockHandle {
            offset: self.offset,
            size: contents.len() as u64,
        };
        self.file.append(contents)?;
        self.file.append(&block_trailer(contents))?;
        self.offset += contents.len() as u64 + super::BLOCK_TRAILER_LEN as u64;
        Ok(handle)
    }
}
