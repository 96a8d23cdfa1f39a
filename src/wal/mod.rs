//! Record-log framing shared by write-ahead logs and manifest files.
//!
//! This module implements a **durable**, **append-only** record log with
//! CRC32C framing. The same format carries serialized write batches in
//! `<n>.log` files and serialized version edits in `MANIFEST-<n>` files.
//!
//! # On-disk layout
//!
//! The file is a sequence of 32 KiB blocks. Each physical record is
//! framed as:
//!
//! ```text
//! [crc32c (4, LE)][length (2, LE)][type (1)][payload (length bytes)]
//! ```
//!
//! The checksum covers `type || payload`. A logical record that does not
//! fit in the current block is split into `First`/`Middle`/`Last`
//! fragments; records that fit emit a single `Full` fragment. A fragment
//! never straddles a block boundary, and a block tail too small to hold a
//! 7-byte header is zero-padded.
//!
//! # Reading and damage
//!
//! [`LogReader`] reassembles logical records and classifies how the log
//! ends:
//!
//! - clean end-of-file,
//! - a record or fragment truncated mid-write (the writer crashed while
//!   appending — expected, reported as a benign end),
//! - zero-filled regions (preallocated space — benign end),
//! - a checksum mismatch or malformed frame inside the durable prefix
//!   (real corruption).
//!
//! In tolerant mode (WAL replay) all of these end the scan without an
//! error, with the reason available from [`LogReader::end_of_log`]; the
//! caller distinguishes a benign end from corruption and escalates the
//! latter (recovery fails the open on a corrupt durable prefix). In
//! strict mode (manifest replay) corruption is returned as an error
//! directly.
//!
//! # Concurrency model
//!
//! A `LogWriter` is owned by one writer at a time; callers serialize
//! through the write queue or the manifest mutex. Readers are only used
//! during recovery, before any writer exists.

#[cfg(test)]
mod tests;

use std::io;

use thiserror::Error;
use tracing::{trace, warn};

use crate::vfs::{SequentialFile, WritableFile};

/// Size of a log block; fragments never cross a block boundary.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Physical record header: crc32c(4) + length(2) + type(1).
pub const HEADER_SIZE: usize = 7;

/// Largest payload a single fragment can carry.
pub const MAX_FRAGMENT_LEN: usize = BLOCK_SIZE - HEADER_SIZE;

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log reading and writing.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame inside the durable prefix of the log is damaged.
    #[error("log corruption at offset {offset}: {reason}")]
    Corruption {
        /// Byte offset of the damaged frame.
        offset: u64,
        /// Human-readable description of the damage.
        reason: String,
    },
}

/// Why a log ended, as reported by a tolerant [`LogReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOfLog {
    /// The log has not ended yet.
    NotReached,

    /// All bytes consumed; the final record was complete.
    CleanEof,

    /// The tail holds a record or fragment cut off mid-write. Normal
    /// after a crash during an append.
    TruncatedTail,

    /// A damaged frame inside the durable prefix stopped the scan.
    Corruption {
        /// Byte offset of the damaged frame.
        offset: u64,
        /// Description of the damage.
        reason: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Record types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}

fn fragment_crc(record_type: RecordType, payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&[record_type as u8]), payload)
}

// ------------------------------------------------------------------------------------------------
// LogWriter
// ------------------------------------------------------------------------------------------------

/// Appends framed records to a [`WritableFile`].
pub struct LogWriter {
    file: Box<dyn WritableFile>,
    /// Bytes already used in the current block (`0..BLOCK_SIZE`).
    block_offset: usize,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("block_offset", &self.block_offset)
            .finish_non_exhaustive()
    }
}

impl LogWriter {
    /// Start a writer on a fresh (empty) file.
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self {
            file,
            block_offset: 0,
        }
    }

    /// Start a writer positioned after `offset` bytes of existing log.
    pub fn new_with_offset(file: Box<dyn WritableFile>, offset: u64) -> Self {
        Self {
            file,
            block_offset: (offset % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Append one logical record, fragmenting across blocks as needed.
    ///
    /// The bytes are buffered; call [`flush`](Self::flush) or
    /// [`sync`](Self::sync) to push them down.
    pub fn add_record(&mut self, mut payload: &[u8]) -> Result<(), WalError> {
        let mut first_fragment = true;
        // An empty record still emits one zero-length Full fragment.
        while !payload.is_empty() || first_fragment {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Zero-pad the tail; a header must not straddle blocks.
                const ZEROS: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];
                self.file.append(&ZEROS[..leftover])?;
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = payload.len().min(available);
            let last_fragment = fragment_len == payload.len();
            let record_type = match (first_fragment, last_fragment) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            let (fragment, rest) = payload.split_at(fragment_len);
            let crc = fragment_crc(record_type, fragment);

            self.file.append(&crc.to_le_bytes())?;
            self.file.append(&(fragment_len as u16).to_le_bytes())?;
            self.file.append(&[record_type as u8])?;
            self.file.append(fragment)?;

            trace!(
                len = fragment_len,
                record_type = record_type as u8,
                "log fragment appended"
            );

            self.block_offset += HEADER_SIZE + fragment_len;
            payload = rest;
            first_fragment = false;
            if last_fragment {
                break;
            }
        }
        Ok(())
    }

    /// Push buffered bytes to the operating system.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush, then fsync the log file.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync()?;
        Ok(())
    }

    /// Total bytes appended to the log file so far.
    pub fn file_size(&self) -> u64 {
        self.file.size()
    }

    /// Flush and close the underlying file.
    pub fn close(&mut self) -> Result<(), WalError> {
        self.file.close()?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// LogReader
// ------------------------------------------------------------------------------------------------

enum Physical {
    Fragment(RecordType, Vec<u8>),
    End,
}

/// Reassembles logical records from a framed log file.
pub struct LogReader {
    file: Box<dyn SequentialFile>,
    /// If true, damaged frames are returned as [`WalError::Corruption`];
    /// if false they quietly end the log (WAL-replay behaviour).
    strict: bool,
    block: Vec<u8>,
    block_len: usize,
    block_pos: usize,
    file_eof: bool,
    /// File offset of the start of the current block.
    block_file_offset: u64,
    end: EndOfLog,
}

impl std::fmt::Debug for LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("strict", &self.strict)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

impl LogReader {
    /// Create a reader. `strict` selects manifest-replay behaviour
    /// (corruption is an error) over WAL-replay behaviour (corruption
    /// ends the log).
    pub fn new(file: Box<dyn SequentialFile>, strict: bool) -> Self {
        Self {
            file,
            strict,
            block: vec![0; BLOCK_SIZE],
            block_len: 0,
            block_pos: 0,
            file_eof: false,
            block_file_offset: 0,
            end: EndOfLog::NotReached,
        }
    }

    /// Why the log ended. Meaningful once `read_record` has returned
    /// `Ok(None)`.
    pub fn end_of_log(&self) -> &EndOfLog {
        &self.end
    }

    /// Read the next logical record.
    ///
    /// Returns `Ok(None)` when the log has ended; consult
    /// [`end_of_log`](Self::end_of_log) for the reason.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        if self.end != EndOfLog::NotReached {
            return Ok(None);
        }

        let mut assembled: Vec<u8> = Vec::new();
        let mut in_fragmented = false;

        loop {
            let fragment_offset = self.current_offset();
            match self.read_physical()? {
                Physical::End => {
                    if in_fragmented && self.end == EndOfLog::CleanEof {
                        // The writer crashed between fragments.
                        self.end = EndOfLog::TruncatedTail;
                    }
                    if in_fragmented {
                        warn!(
                            buffered = assembled.len(),
                            "log ended inside a fragmented record; dropping partial record"
                        );
                    }
                    return Ok(None);
                }
                Physical::Fragment(RecordType::Full, payload) => {
                    if in_fragmented {
                        return self.corrupt(fragment_offset, "Full fragment inside fragmented record");
                    }
                    return Ok(Some(payload));
                }
                Physical::Fragment(RecordType::First, payload) => {
                    if in_fragmented {
                        return self.corrupt(fragment_offset, "second First fragment in record");
                    }
                    in_fragmented = true;
                    assembled = payload;
                }
                Physical::Fragment(RecordType::Middle, payload) => {
                    if !in_fragmented {
                        return self.corrupt(fragment_offset, "Middle fragment without First");
                    }
                    assembled.extend_from_slice(&payload);
                }
                Physical::Fragment(RecordType::Last, payload) => {
                    if !in_fragmented {
                        return self.corrupt(fragment_offset, "Last fragment without First");
                    }
                    assembled.extend_from_slice(&payload);
                    return Ok(Some(assembled));
                }
            }
        }
    }

    fn current_offset(&self) -> u64 {
        self.block_file_offset + self.block_pos as u64
    }

    /// Handle a damaged frame per the reader's mode.
    fn corrupt(&mut self, offset: u64, reason: &str) -> Result<Option<Vec<u8>>, WalError> {
        if self.strict {
            Err(WalError::Corruption {
                offset,
                reason: reason.to_string(),
            })
        } else {
            warn!(offset, reason, "log replay stopped at damaged frame");
            self.end = EndOfLog::Corruption {
                offset,
                reason: reason.to_string(),
            };
            Ok(None)
        }
    }

    fn refill(&mut self) -> Result<(), WalError> {
        self.block_file_offset += self.block_len as u64;
        self.block_pos = 0;
        self.block_len = 0;
        while self.block_len < BLOCK_SIZE {
            let n = self.file.read(&mut self.block[self.block_len..])?;
            if n == 0 {
                self.file_eof = true;
                break;
            }
            self.block_len += n;
        }
        Ok(())
    }

    fn read_physical(&mut self) -> Result<Physical, WalError> {
        loop {
            // Need a full header in the current block.
            if self.block_pos + HEADER_SIZE > self.block_len {
                let tail = &self.block[self.block_pos..self.block_len];
                let tail_is_zero = tail.iter().all(|&b| b == 0);
                if self.block_len == BLOCK_SIZE || tail.is_empty() || tail_is_zero {
                    // Block trailer padding, exact block boundary, or a
                    // zero tail; move on (or finish at EOF).
                    if self.file_eof && self.block_pos >= self.block_len {
                        self.end = EndOfLog::CleanEof;
                        return Ok(Physical::End);
                    }
                    if self.file_eof && tail_is_zero {
                        self.end = EndOfLog::CleanEof;
                        return Ok(Physical::End);
                    }
                    if self.file_eof {
                        self.end = EndOfLog::TruncatedTail;
                        return Ok(Physical::End);
                    }
                    self.refill()?;
                    if self.block_len == 0 {
                        self.end = EndOfLog::CleanEof;
                        return Ok(Physical::End);
                    }
                    continue;
                }
                // Short non-zero tail in the final, partial block: a
                // header cut off mid-write.
                self.end = EndOfLog::TruncatedTail;
                return Ok(Physical::End);
            }

            let header = &self.block[self.block_pos..self.block_pos + HEADER_SIZE];
            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if type_byte == 0 && stored_crc == 0 && length == 0 {
                // Zero-filled region (preallocated space). Skip to the
                // end of this block.
                self.block_pos = self.block_len;
                continue;
            }

            let frame_offset = self.current_offset();
            let payload_start = self.block_pos + HEADER_SIZE;
            let payload_end = payload_start + length;

            if payload_end > self.block_len {
                if self.file_eof && self.block_len < BLOCK_SIZE {
                    // Payload cut off mid-write at the log tail.
                    self.end = EndOfLog::TruncatedTail;
                    return Ok(Physical::End);
                }
                return self
                    .physical_corrupt(frame_offset, "fragment length overruns block")
                    .map(|()| Physical::End);
            }

            let Some(record_type) = RecordType::from_u8(type_byte) else {
                return self
                    .physical_corrupt(frame_offset, &format!("unknown record type {type_byte}"))
                    .map(|()| Physical::End);
            };

            let payload = &self.block[payload_start..payload_end];
            if fragment_crc(record_type, payload) != stored_crc {
                if self.file_eof
                    && self.block_len < BLOCK_SIZE
                    && payload_end == self.block_len
                {
                    // The final fragment of the file with a bad CRC is
                    // indistinguishable from a torn write.
                    self.end = EndOfLog::TruncatedTail;
                    return Ok(Physical::End);
                }
                return self
                    .physical_corrupt(frame_offset, "checksum mismatch")
                    .map(|()| Physical::End);
            }

            let owned = payload.to_vec();
            self.block_pos = payload_end;
            return Ok(Physical::Fragment(record_type, owned));
        }
    }

    fn physical_corrupt(&mut self, offset: u64, reason: &str) -> Result<(), WalError> {
        if self.strict {
            Err(WalError::Corruption {
                offset,
                reason: reason.to_string(),
            })
        } else {
            warn!(offset, reason, "log replay stopped at damaged frame");
            self.end = EndOfLog::Corruption {
                offset,
                reason: reason.to_string(),
            };
            Ok(())
        }
    }
}
