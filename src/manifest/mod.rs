//! Manifest & version set — the authoritative record of durable state.
//!
//! ## Design overview
//!
//! The set of live tables, the last-used sequence number, and the oldest
//! WAL that must be replayed are described by an immutable [`Version`].
//! Mutations are expressed as [`VersionEdit`] deltas, serialized into an
//! append-only `MANIFEST-<n>` file using the same CRC32C log framing as
//! the WAL. The single-line `CURRENT` file names the active manifest.
//!
//! ## The one write path: `log_and_apply`
//!
//! Every durable-state mutation goes through
//! [`VersionSet::log_and_apply`], which is strictly ordered:
//!
//! 1. If this is the first edit of a new manifest file, create it and
//!    write a snapshot of the current version.
//! 2. Serialize the edit and append it as one framed record.
//! 3. Flush the manifest buffer.
//! 4. Sync the manifest file.
//! 5. If a manifest was just created: write `CURRENT.tmp`, atomically
//!    rename it over `CURRENT`, and sync the directory.
//! 6. Only then install the new version in memory.
//!
//! Until step 4 succeeds nothing in memory changes; a failure leaves the
//! previous version current and the previous manifest active.
//!
//! ## LastSequence monotonicity
//!
//! Installing an edit never lowers `last_sequence`: the installed value
//! is `max(prior, edit's value, largest seqno of any added file)`. The
//! write path's in-memory sequence counter is never written here
//! directly, so sequences lost with an unflushed memtable cannot leak
//! into the manifest.
//!
//! ## Recovery
//!
//! [`VersionSet::recover`] validates `CURRENT`, replays every edit of the
//! named manifest in strict mode (corruption is fatal), rebuilds the
//! version, cross-checks that every referenced table exists on disk, and
//! arms the counters for the session.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crashpoint::{kill_point, sync_point};
use crate::encoding::{
    self, EncodingError, get_varint32, get_varint64, put_varint32, put_varint64,
};
use crate::filenames;
use crate::keys::{InternalKey, SequenceNumber};
use crate::vfs::{FileSystem, WritableFile as _, read_file_to_vec};
use crate::wal::{LogReader, LogWriter, WalError};

/// Comparator identity recorded in every manifest.
pub const COMPARATOR_NAME: &str = "rockyardkv.BytewiseComparator";

// Version-edit field tags.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Log-framing failure while reading or writing the manifest.
    #[error("manifest log error: {0}")]
    Wal(#[from] WalError),

    /// The manifest chain is structurally damaged or inconsistent.
    #[error("manifest corruption: {0}")]
    Corruption(String),

    /// A primitive failed to decode.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The caller violated a contract (e.g. comparator mismatch).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// FileMetaData
// ------------------------------------------------------------------------------------------------

/// Descriptor of one live table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    /// Globally unique, monotonically assigned; also the on-disk name.
    pub file_number: u64,

    /// Level the file lives on.
    pub level: u32,

    /// File size in bytes.
    pub file_size: u64,

    /// Smallest internal key in the file.
    pub smallest: InternalKey,

    /// Largest internal key in the file.
    pub largest: InternalKey,

    /// Smallest sequence number of any record in the file.
    pub smallest_seqno: SequenceNumber,

    /// Largest sequence number of any record in the file.
    pub largest_seqno: SequenceNumber,
}

impl FileMetaData {
    /// Whether the file's user-key range overlaps `[start, end]`
    /// (inclusive bounds; `None` means unbounded).
    pub fn overlaps_user_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        if let Some(end) = end {
            if self.smallest.user_key() > end {
                return false;
            }
        }
        if let Some(start) = start {
            if self.largest.user_key() < start {
                return false;
            }
        }
        true
    }
}

// ------------------------------------------------------------------------------------------------
// VersionEdit
// ------------------------------------------------------------------------------------------------

/// A delta applied to produce a new [`Version`]; the only record type
/// written to the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    /// Comparator identity; present in snapshots and the bootstrap edit.
    pub comparator_name: Option<String>,

    /// The oldest WAL whose records are *not* yet in tables.
    pub log_number: Option<u64>,

    /// Historical second WAL number; retained for format completeness.
    pub prev_log_number: Option<u64>,

    /// High-water file number at the time of this edit.
    pub next_file_number: Option<u64>,

    /// Last used sequence at the time of this edit.
    pub last_sequence: Option<SequenceNumber>,

    /// Per-level compaction cursors.
    pub compact_pointers: Vec<(u32, InternalKey)>,

    /// Files dropped by this edit: `(level, file_number)`.
    pub deleted_files: Vec<(u32, u64)>,

    /// Files added by this edit.
    pub new_files: Vec<FileMetaData>,
}

impl VersionEdit {
    /// Serialize into the manifest record payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator_name {
            put_varint32(&mut buf, TAG_COMPARATOR);
            encoding::put_length_prefixed_slice(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(&mut buf, TAG_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint32(&mut buf, TAG_LAST_SEQUENCE);
            put_varint64(&mut buf, n);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(&mut buf, TAG_COMPACT_POINTER);
            put_varint32(&mut buf, *level);
            encoding::put_length_prefixed_slice(&mut buf, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut buf, TAG_DELETED_FILE);
            put_varint32(&mut buf, *level);
            put_varint64(&mut buf, *number);
        }
        for file in &self.new_files {
            put_varint32(&mut buf, TAG_NEW_FILE);
            put_varint32(&mut buf, file.level);
            put_varint64(&mut buf, file.file_number);
            put_varint64(&mut buf, file.file_size);
            encoding::put_length_prefixed_slice(&mut buf, file.smallest.encoded());
            encoding::put_length_prefixed_slice(&mut buf, file.largest.encoded());
            put_varint64(&mut buf, file.smallest_seqno);
            put_varint64(&mut buf, file.largest_seqno);
        }
        buf
    }

    /// Decode a manifest record payload.
    pub fn decode(buf: &[u8]) -> Result<Self, ManifestError> {
        let mut edit = Self::default();
        let mut pos = 0usize;
        while pos < buf.len() {
            let (tag, n) = get_varint32(&buf[pos..])?;
            pos += n;
            match tag {
                TAG_COMPARATOR => {
                    let (raw, n) = encoding::get_length_prefixed_slice(&buf[pos..])?;
                    pos += n;
                    let name = String::from_utf8(raw).map_err(|_| {
                        ManifestError::Corruption("comparator name is not UTF-8".into())
                    })?;
                    edit.comparator_name = Some(name);
                }
                TAG_LOG_NUMBER => {
                    let (v, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    edit.log_number = Some(v);
                }
                TAG_PREV_LOG_NUMBER => {
                    let (v, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    edit.prev_log_number = Some(v);
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (v, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    edit.next_file_number = Some(v);
                }
                TAG_LAST_SEQUENCE => {
                    let (v, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    edit.last_sequence = Some(v);
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = get_varint32(&buf[pos..])?;
                    pos += n;
                    let (raw, n) = encoding::get_length_prefixed_slice(&buf[pos..])?;
                    pos += n;
                    let key = InternalKey::from_encoded(raw).ok_or_else(|| {
                        ManifestError::Corruption("undecodable compact pointer".into())
                    })?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let (level, n) = get_varint32(&buf[pos..])?;
                    pos += n;
                    let (number, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let (level, n) = get_varint32(&buf[pos..])?;
                    pos += n;
                    let (file_number, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    let (file_size, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    let (smallest_raw, n) = encoding::get_length_prefixed_slice(&buf[pos..])?;
                    pos += n;
                    let (largest_raw, n) = encoding::get_length_prefixed_slice(&buf[pos..])?;
                    pos += n;
                    let (smallest_seqno, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    let (largest_seqno, n) = get_varint64(&buf[pos..])?;
                    pos += n;
                    let smallest = InternalKey::from_encoded(smallest_raw).ok_or_else(|| {
                        ManifestError::Corruption("undecodable smallest key".into())
                    })?;
                    let largest = InternalKey::from_encoded(largest_raw).ok_or_else(|| {
                        ManifestError::Corruption("undecodable largest key".into())
                    })?;
                    edit.new_files.push(FileMetaData {
                        file_number,
                        level,
                        file_size,
                        smallest,
                        largest,
                        smallest_seqno,
                        largest_seqno,
                    });
                }
                other => {
                    return Err(ManifestError::Corruption(format!(
                        "unknown version-edit tag {other}"
                    )));
                }
            }
        }
        Ok(edit)
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// An immutable snapshot of the live file set plus counters.
#[derive(Debug, Clone)]
pub struct Version {
    /// Files per level. Level 0 is ordered newest-first (largest seqno
    /// first); deeper levels are ordered by smallest key.
    files: Vec<Vec<Arc<FileMetaData>>>,

    /// Last used sequence at install time.
    pub last_sequence: SequenceNumber,

    /// High-water file number at install time.
    pub next_file_number: u64,

    /// Oldest WAL that must be replayed on recovery.
    pub log_number: u64,
}

impl Version {
    fn empty(num_levels: usize) -> Self {
        Self {
            files: vec![Vec::new(); num_levels],
            last_sequence: 0,
            next_file_number: 0,
            log_number: 0,
        }
    }

    /// Number of levels.
    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    /// Files on `level`.
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Total number of live files.
    pub fn num_files(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    /// File numbers of every live file.
    pub fn live_file_numbers(&self) -> HashSet<u64> {
        self.files
            .iter()
            .flatten()
            .map(|file| file.file_number)
            .collect()
    }

    /// Files on `level` whose user-key range overlaps `[start, end]`.
    pub fn overlapping_files(
        &self,
        level: usize,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        self.files[level]
            .iter()
            .filter(|file| file.overlaps_user_range(start, end))
            .cloned()
            .collect()
    }

    /// Largest sequence number recorded in any live file.
    pub fn max_file_seqno(&self) -> SequenceNumber {
        self.files
            .iter()
            .flatten()
            .map(|file| file.largest_seqno)
            .max()
            .unwrap_or(0)
    }
}

// ------------------------------------------------------------------------------------------------
// VersionBuilder
// ------------------------------------------------------------------------------------------------

/// Accumulates edits on top of a base version.
struct VersionBuilder {
    base: Arc<Version>,
    added: Vec<Vec<Arc<FileMetaData>>>,
    deleted: Vec<HashSet<u64>>,
}

impl VersionBuilder {
    fn new(base: Arc<Version>) -> Self {
        let levels = base.num_levels();
        Self {
            base,
            added: vec![Vec::new(); levels],
            deleted: vec![HashSet::new(); levels],
        }
    }

    fn apply(&mut self, edit: &VersionEdit) -> Result<(), ManifestError> {
        for (level, number) in &edit.deleted_files {
            let level = *level as usize;
            if level >= self.deleted.len() {
                return Err(ManifestError::Corruption(format!(
                    "edit deletes file on level {level} beyond configured levels"
                )));
            }
            self.deleted[level].insert(*number);
        }
        for file in &edit.new_files {
            let level = file.level as usize;
            if level >= self.added.len() {
                return Err(ManifestError::Corruption(format!(
                    "edit adds file on level {level} beyond configured levels"
                )));
            }
            self.deleted[level].remove(&file.file_number);
            self.added[level].push(Arc::new(file.clone()));
        }
        Ok(())
    }

    fn build(
        self,
        last_sequence: SequenceNumber,
        next_file_number: u64,
        log_number: u64,
    ) -> Version {
        let mut files = Vec::with_capacity(self.base.num_levels());
        for (level, added) in self.added.into_iter().enumerate() {
            let deleted = &self.deleted[level];
            let mut merged: Vec<Arc<FileMetaData>> = self
                .base
                .files(level)
                .iter()
                .filter(|file| !deleted.contains(&file.file_number))
                .cloned()
                .collect();
            // Idempotent re-adds: a retried edit (or a manifest holding a
            // synced-but-unacknowledged record plus its retry) must not
            // produce duplicate files.
            let mut seen: HashSet<u64> = merged.iter().map(|f| f.file_number).collect();
            for file in added {
                if seen.insert(file.file_number) {
                    merged.push(file);
                }
            }
            if level == 0 {
                // Newest data first so reads and recovery scan in
                // recency order.
                merged.sort_by(|a, b| {
                    b.largest_seqno
                        .cmp(&a.largest_seqno)
                        .then(b.file_number.cmp(&a.file_number))
                });
            } else {
                merged.sort_by(|a, b| a.smallest.cmp(&b.smallest));
            }
            files.push(merged);
        }
        Version {
            files,
            last_sequence,
            next_file_number,
            log_number,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// Owns the current version, the durable counters, and the manifest log.
///
/// Callers serialize access through the database's manifest mutex.
pub struct VersionSet {
    fs: Arc<dyn FileSystem>,
    db_path: PathBuf,
    num_levels: usize,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    prev_log_number: u64,

    current: Arc<Version>,
    compact_pointers: Vec<Option<InternalKey>>,
    manifest_log: Option<LogWriter>,
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("next_file_number", &self.next_file_number)
            .field("manifest_file_number", &self.manifest_file_number)
            .field("last_sequence", &self.last_sequence)
            .field("log_number", &self.log_number)
            .field("live_files", &self.current.num_files())
            .finish_non_exhaustive()
    }
}

impl VersionSet {
    /// A fresh version set over an empty version.
    pub fn new(fs: Arc<dyn FileSystem>, db_path: &Path, num_levels: usize) -> Self {
        Self {
            fs,
            db_path: db_path.to_path_buf(),
            num_levels,
            // File number 1 is reserved for the first manifest.
            next_file_number: 2,
            manifest_file_number: 1,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            current: Arc::new(Version::empty(num_levels)),
            compact_pointers: vec![None; num_levels],
            manifest_log: None,
        }
    }

    /// The installed version.
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// Highest sequence number recorded durably.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// The oldest WAL whose records are not yet in tables.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Allocate a fresh, globally unique file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Ensure future allocations stay above `number`.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// File numbers referenced by the installed version.
    pub fn live_files(&self) -> HashSet<u64> {
        self.current.live_file_numbers()
    }

    // --------------------------------------------------------------------
    // LogAndApply
    // --------------------------------------------------------------------

    /// Apply `edit` durably, then install the resulting version.
    ///
    /// See the module documentation for the exact step ordering; no
    /// in-memory state changes until the manifest record is synced (and,
    /// on rotation, CURRENT has moved).
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<(), ManifestError> {
        sync_point("VersionSet::LogAndApply:Start");

        match edit.log_number {
            Some(n) => {
                if n < self.log_number || n >= self.next_file_number {
                    return Err(ManifestError::InvalidArgument(format!(
                        "edit log_number {n} outside [{}, {})",
                        self.log_number, self.next_file_number
                    )));
                }
            }
            None => edit.log_number = Some(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(self.prev_log_number);
        }
        // The recorded high-water mark must cover every file this edit
        // introduces.
        for file in &edit.new_files {
            self.mark_file_number_used(file.file_number);
        }
        edit.next_file_number = Some(self.next_file_number);

        // LastSequence monotonicity: never lower, never taken from a
        // counter that ran ahead of durable state.
        let added_max = edit
            .new_files
            .iter()
            .map(|f| f.largest_seqno)
            .max()
            .unwrap_or(0);
        let new_last_sequence = self
            .last_sequence
            .max(added_max)
            .max(edit.last_sequence.unwrap_or(0));
        edit.last_sequence = Some(new_last_sequence);

        // Build the candidate version before any I/O so a malformed edit
        // cannot touch the manifest.
        let mut builder = VersionBuilder::new(self.current());
        builder.apply(edit)?;
        for (level, key) in &edit.compact_pointers {
            if let Some(slot) = self.compact_pointers.get_mut(*level as usize) {
                *slot = Some(key.clone());
            }
        }
        let version = builder.build(
            new_last_sequence,
            self.next_file_number,
            edit.log_number.unwrap_or(self.log_number),
        );

        let creating_manifest = self.manifest_log.is_none();
        if creating_manifest {
            let path = filenames::manifest_file_name(&self.db_path, self.manifest_file_number);
            let file = self.fs.create(&path)?;
            let mut writer = LogWriter::new(file);
            if let Err(err) = self.write_snapshot(&mut writer) {
                let _ = self.fs.remove(&path);
                return Err(err);
            }
            self.manifest_log = Some(writer);
            info!(manifest = self.manifest_file_number, "created manifest file");
        }

        let result = self.append_and_sync(edit, creating_manifest);
        if let Err(err) = result {
            if creating_manifest {
                // The half-born manifest is unusable; CURRENT still
                // points at the previous one (or nothing).
                self.manifest_log = None;
                let path = filenames::manifest_file_name(&self.db_path, self.manifest_file_number);
                let _ = self.fs.remove(&path);
            }
            return Err(err);
        }

        // Step 6 — install. The edit is durable; memory may now change.
        self.current = Arc::new(version);
        self.last_sequence = new_last_sequence;
        self.log_number = edit.log_number.unwrap_or(self.log_number);
        self.prev_log_number = edit.prev_log_number.unwrap_or(self.prev_log_number);

        debug!(
            last_sequence = self.last_sequence,
            log_number = self.log_number,
            live_files = self.current.num_files(),
            "version edit installed"
        );
        sync_point("VersionSet::LogAndApply:Complete");
        Ok(())
    }

    fn append_and_sync(
        &mut self,
        edit: &VersionEdit,
        creating_manifest: bool,
    ) -> Result<(), ManifestError> {
        let record = edit.encode();
        let writer = self
            .manifest_log
            .as_mut()
            .ok_or_else(|| ManifestError::InvalidArgument("manifest log missing".into()))?;

        kill_point("Manifest.Write:0");
        writer.add_record(&record)?;
        writer.flush()?;
        kill_point("Manifest.Sync:0");
        writer.sync()?;
        kill_point("Manifest.Sync:1");

        if creating_manifest {
            kill_point("Current.Write:0");
            self.install_current_file()?;
            kill_point("Current.Write:1");
        }
        Ok(())
    }

    /// Atomically point CURRENT at the active manifest: write the temp
    /// file, rename, sync the directory.
    fn install_current_file(&self) -> Result<(), ManifestError> {
        let tmp = filenames::current_tmp_file_name(&self.db_path);
        let current = filenames::current_file_name(&self.db_path);
        let contents = format!(
            "{}\n",
            filenames::manifest_base_name(self.manifest_file_number)
        );

        let mut file = self.fs.create(&tmp)?;
        file.append(contents.as_bytes())?;
        file.sync()?;
        file.close()?;

        self.fs.rename(&tmp, &current)?;
        kill_point("Dir.Sync:0");
        self.fs.sync_dir(&self.db_path)?;
        kill_point("Dir.Sync:1");
        info!(manifest = self.manifest_file_number, "CURRENT installed");
        Ok(())
    }

    /// Serialize the full current state as the first record of a new
    /// manifest.
    fn write_snapshot(&self, writer: &mut LogWriter) -> Result<(), ManifestError> {
        let mut edit = VersionEdit {
            comparator_name: Some(COMPARATOR_NAME.to_string()),
            ..VersionEdit::default()
        };
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = pointer {
                edit.compact_pointers.push((level as u32, key.clone()));
            }
        }
        for level in 0..self.current.num_levels() {
            for file in self.current.files(level) {
                edit.new_files.push(FileMetaData {
                    level: level as u32,
                    ..(**file).clone()
                });
            }
        }
        writer.add_record(&edit.encode())?;
        Ok(())
    }

    // --------------------------------------------------------------------
    // Recover
    // --------------------------------------------------------------------

    /// Bootstrap an empty database: create the first manifest and point
    /// CURRENT at it.
    pub fn bootstrap(&mut self) -> Result<(), ManifestError> {
        let mut edit = VersionEdit {
            comparator_name: Some(COMPARATOR_NAME.to_string()),
            log_number: Some(0),
            last_sequence: Some(0),
            ..VersionEdit::default()
        };
        self.log_and_apply(&mut edit)
    }

    /// Rebuild state from CURRENT + the active manifest.
    pub fn recover(&mut self) -> Result<(), ManifestError> {
        sync_point("VersionSet::Recover:Start");

        let current_path = filenames::current_file_name(&self.db_path);
        let raw = read_file_to_vec(&*self.fs, &current_path)?;
        let contents = String::from_utf8(raw)
            .map_err(|_| ManifestError::Corruption("CURRENT is not UTF-8".into()))?;
        let manifest_number = filenames::parse_current_contents(&contents).ok_or_else(|| {
            ManifestError::Corruption(format!("CURRENT names no manifest: {contents:?}"))
        })?;

        let manifest_path = filenames::manifest_file_name(&self.db_path, manifest_number);
        if !self.fs.exists(&manifest_path) {
            return Err(ManifestError::Corruption(format!(
                "CURRENT names missing manifest {manifest_number}"
            )));
        }

        let file = self.fs.open_sequential(&manifest_path)?;
        let mut reader = LogReader::new(file, true);

        let mut builder = VersionBuilder::new(self.current());
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;
        let mut edits = 0u64;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                if name != COMPARATOR_NAME {
                    return Err(ManifestError::InvalidArgument(format!(
                        "comparator {name:?} does not match {COMPARATOR_NAME:?}"
                    )));
                }
            }
            builder.apply(&edit)?;
            for (level, key) in &edit.compact_pointers {
                if let Some(slot) = self.compact_pointers.get_mut(*level as usize) {
                    *slot = Some(key.clone());
                }
            }
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
            edits += 1;
        }
        if let crate::wal::EndOfLog::TruncatedTail = reader.end_of_log() {
            warn!("manifest ends in a torn record; recovering to the last complete edit");
        }

        let next_file_number = next_file_number.ok_or_else(|| {
            ManifestError::Corruption("manifest carries no next_file_number".into())
        })?;
        let log_number = log_number
            .ok_or_else(|| ManifestError::Corruption("manifest carries no log_number".into()))?;
        let last_sequence = last_sequence.ok_or_else(|| {
            ManifestError::Corruption("manifest carries no last_sequence".into())
        })?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let version = builder.build(last_sequence, next_file_number, log_number);

        // Every file the recovered version references must exist.
        for level in 0..version.num_levels() {
            for file in version.files(level) {
                let path = filenames::table_file_name(&self.db_path, file.file_number);
                if !self.fs.exists(&path) {
                    return Err(ManifestError::Corruption(format!(
                        "live table {} is missing from disk",
                        file.file_number
                    )));
                }
            }
        }

        self.next_file_number = next_file_number;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(manifest_number);
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        for number in version.live_file_numbers() {
            self.mark_file_number_used(number);
        }
        self.current = Arc::new(version);
        // The next manifest rotation gets a fresh number; the old
        // manifest stays valid until CURRENT moves.
        self.manifest_file_number = self.new_file_number();
        self.manifest_log = None;

        info!(
            edits,
            manifest = manifest_number,
            last_sequence = self.last_sequence,
            log_number = self.log_number,
            live_files = self.current.num_files(),
            "version set recovered"
        );
        sync_point("VersionSet::Recover:Complete");
        Ok(())
    }

    /// Flush and close the manifest log (used by clean shutdown).
    pub fn close(&mut self) -> Result<(), ManifestError> {
        if let Some(writer) = &mut self.manifest_log {
            writer.sync()?;
            writer.close()?;
        }
        self.manifest_log = None;
        Ok(())
    }
}
