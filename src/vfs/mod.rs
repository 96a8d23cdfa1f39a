//! Virtual filesystem layer.
//!
//! Every file, directory, sync, rename, and lock operation in the engine
//! goes through the [`FileSystem`] trait, so that the durability core can
//! be exercised against a fault-injecting implementation with the exact
//! same code paths it uses in production.
//!
//! ## Implementations
//!
//! - [`StdFs`] — the default POSIX-like filesystem backed by `std::fs`,
//!   with mmap-backed random-access reads.
//! - [`fault::FaultFs`] — a decorator that records write/sync state and
//!   can simulate crashes: drop unsynced data, revert unsynced renames,
//!   delete never-synced files, inject read/write/sync errors.
//! - [`direct::DirectIoFs`] — a decorator that enforces the alignment
//!   rules of direct I/O (aligned offsets, lengths, and buffers).
//!
//! ## Contract highlights
//!
//! - [`WritableFile::sync`] returning `Ok` means every byte previously
//!   appended is on stable storage.
//! - [`FileSystem::sync_dir`] persists the *directory entry* itself; it is
//!   distinct from file sync and required after create/rename for the new
//!   name to survive a crash.
//! - [`FileSystem::rename`] has POSIX semantics: atomic replace on a
//!   local filesystem.
//! - [`FileSystem::lock`] takes an advisory exclusive lock; releasing the
//!   lock (or dropping it) releases the file handle.

pub mod direct;
pub mod fault;

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use fs4::fs_std::FileExt as FileLockExt;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

// ------------------------------------------------------------------------------------------------
// Error types
// ------------------------------------------------------------------------------------------------

/// Failure to take the database lock file.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process (or handle) holds the advisory lock.
    #[error("lock is already held")]
    AlreadyLocked,

    /// Underlying I/O error while opening or locking the file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// File traits
// ------------------------------------------------------------------------------------------------

/// An append-only file handle.
///
/// After [`sync`](Self::sync) returns, all bytes previously written are on
/// stable storage.
pub trait WritableFile: Send {
    /// Append bytes to the file (buffered).
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Alias for [`append`](Self::append); the file is append-only.
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.append(data)
    }

    /// Push buffered bytes to the operating system without syncing.
    fn flush(&mut self) -> io::Result<()>;

    /// Flush, then fsync file contents to stable storage.
    fn sync(&mut self) -> io::Result<()>;

    /// Total bytes appended so far (including still-buffered bytes).
    fn size(&self) -> u64;

    /// Flush and close the handle. Idempotent.
    fn close(&mut self) -> io::Result<()>;
}

/// A forward-only reader.
pub trait SequentialFile: Send {
    /// Read up to `buf.len()` bytes; returns the number read (0 = EOF).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Skip `n` bytes forward.
    fn skip(&mut self, n: u64) -> io::Result<()>;
}

/// A positional reader, shareable across threads.
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `len` bytes starting at `offset`. A short result means
    /// the range extends past end-of-file.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Current file size in bytes.
    fn size(&self) -> u64;
}

/// An advisory exclusive lock; dropping it releases the lock.
pub trait FileLock: Send {
    /// Explicitly release the lock and its file handle.
    fn release(&mut self) -> io::Result<()>;
}

/// Metadata returned by [`FileSystem::stat`].
#[derive(Debug, Clone)]
pub struct FileStat {
    /// File size in bytes (0 for directories on some platforms).
    pub size: u64,
    /// Whether the path names a directory.
    pub is_dir: bool,
    /// Last modification time.
    pub mtime: SystemTime,
}

// ------------------------------------------------------------------------------------------------
// FileSystem trait
// ------------------------------------------------------------------------------------------------

/// The pluggable filesystem consumed by every component of the engine.
pub trait FileSystem: Send + Sync {
    /// Create (overwrite-truncate) a writable file.
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;

    /// Open a file for forward-only reading.
    fn open_sequential(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>>;

    /// Open a file for positional reads.
    fn open_random(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>>;

    /// Atomically rename `src` to `dst`, replacing `dst` if present.
    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Remove a file.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory tree.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Create a directory and all missing parents.
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Truncate a file to `size` bytes.
    fn truncate(&self, path: &Path, size: u64) -> io::Result<()>;

    /// Stat a path.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// List the entries of a directory (full paths).
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Whether the path exists.
    fn exists(&self, path: &Path) -> bool;

    /// fsync the directory entry itself. Distinct from file sync.
    fn sync_dir(&self, path: &Path) -> io::Result<()>;

    /// Take an advisory exclusive lock on `path`, creating the file if
    /// missing.
    fn lock(&self, path: &Path) -> Result<Box<dyn FileLock>, LockError>;
}

// ------------------------------------------------------------------------------------------------
// StdFs — default POSIX-like implementation
// ------------------------------------------------------------------------------------------------

/// The default filesystem, backed by `std::fs`.
///
/// Random-access reads are served from a read-only memory map; writable
/// files buffer appends and write through on flush/sync/close.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl StdFs {
    /// Shared handle, ready to plug into `DbOptions`.
    pub fn shared() -> Arc<dyn FileSystem> {
        Arc::new(Self)
    }
}

impl FileSystem for StdFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), "created writable file");
        Ok(Box::new(StdWritableFile {
            file: Some(file),
            buffer: Vec::new(),
            written: 0,
        }))
    }

    fn open_sequential(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        let file = File::open(path)?;
        Ok(Box::new(StdSequentialFile { file }))
    }

    fn open_random(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // Mapping a zero-length file is rejected on several platforms;
        // an empty mapping serves the same (vacuous) reads.
        let mmap = if len == 0 {
            None
        } else {
            // The mapping is read-only and tables are immutable once
            // published, so the contents cannot change underneath us.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Arc::new(MmapRandomFile { mmap, len }))
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::rename(src, dst)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(size)?;
        file.sync_all()
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::metadata(path)?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
            mtime: meta.modified()?,
        })
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        File::open(path)?.sync_all()
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn FileLock>, LockError> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        match FileLockExt::try_lock_exclusive(&file) {
            Ok(true) => Ok(Box::new(StdFileLock { file: Some(file) })),
            Ok(false) => Err(LockError::AlreadyLocked),
            Err(err) => Err(LockError::Io(err)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// StdFs file handles
// ------------------------------------------------------------------------------------------------

struct StdWritableFile {
    file: Option<File>,
    buffer: Vec<u8>,
    written: u64,
}

impl StdWritableFile {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("file already closed"))
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        match self.file()?.write_all(&pending) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Keep the bytes so a caller-level retry sees a
                // consistent `size()`.
                self.buffer = pending;
                Err(err)
            }
        }
    }
}

impl WritableFile for StdWritableFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            return Err(io::Error::other("file already closed"));
        }
        self.buffer.extend_from_slice(data);
        self.written += data.len() as u64;
        // Cap buffering so huge values do not accumulate in memory.
        if self.buffer.len() >= 1 << 20 {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.file()?.sync_all()
    }

    fn size(&self) -> u64 {
        self.written
    }

    fn close(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            self.flush_buffer()?;
            self.file = None;
        }
        Ok(())
    }
}

impl Drop for StdWritableFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "writable file close failed on drop");
        }
    }
}

struct StdSequentialFile {
    file: File,
}

impl SequentialFile for StdSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Current(n as i64)).map(|_| ())
    }
}

struct MmapRandomFile {
    mmap: Option<Mmap>,
    len: u64,
}

impl RandomAccessFile for MmapRandomFile {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let Some(mmap) = &self.mmap else {
            return Ok(Vec::new());
        };
        let start = (offset.min(self.len)) as usize;
        let end = (offset.saturating_add(len as u64).min(self.len)) as usize;
        Ok(mmap[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.len
    }
}

struct StdFileLock {
    file: Option<File>,
}

impl FileLock for StdFileLock {
    fn release(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            FileLockExt::unlock(&file)?;
        }
        Ok(())
    }
}

impl Drop for StdFileLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "lock release failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared helpers
// ------------------------------------------------------------------------------------------------

/// Read an entire file through the VFS sequential interface.
pub fn read_file_to_vec(fs: &dyn FileSystem, path: &Path) -> io::Result<Vec<u8>> {
    let mut file = fs.open_sequential(path)?;
    let mut contents = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        contents.extend_from_slice(&chunk[..n]);
    }
    Ok(contents)
}

/// Write `contents` to `path` through the VFS, syncing before returning.
pub fn write_file_synced(fs: &dyn FileSystem, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs.create(path)?;
    file.append(contents)?;
    file.sync()?;
    file.close()
}
