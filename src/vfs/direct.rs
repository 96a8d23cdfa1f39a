//! Direct-I/O decorator.
//!
//! [`DirectIoFs`] wraps another [`FileSystem`] and enforces the alignment
//! contract of direct I/O: read offsets and lengths must be multiples of
//! the logical block size (≥ 512 bytes, default 4 KiB). Writable files
//! accumulate appends in an internal buffer and push whole aligned blocks
//! through to the wrapped filesystem; the unaligned tail is written when
//! the file is closed or synced.
//!
//! The alignment helpers [`is_aligned`], [`align_up`], and [`align_down`]
//! are exported for callers that size their own buffers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    FileLock, FileStat, FileSystem, LockError, RandomAccessFile, SequentialFile, WritableFile,
};

/// Smallest permitted logical block size.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Default logical block size (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

// ------------------------------------------------------------------------------------------------
// Alignment helpers
// ------------------------------------------------------------------------------------------------

/// Whether `value` is a multiple of `align`.
#[inline]
pub fn is_aligned(value: u64, align: u64) -> bool {
    align != 0 && value % align == 0
}

/// Round `value` up to the next multiple of `align`.
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to the previous multiple of `align`.
#[inline]
pub fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

fn misaligned(what: &str, value: u64, align: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("direct I/O requires {what} aligned to {align} bytes, got {value}"),
    )
}

// ------------------------------------------------------------------------------------------------
// DirectIoFs
// ------------------------------------------------------------------------------------------------

/// Alignment-enforcing decorator around another [`FileSystem`].
#[derive(Clone)]
pub struct DirectIoFs {
    inner: Arc<dyn FileSystem>,
    block_size: usize,
}

impl std::fmt::Debug for DirectIoFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectIoFs")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl DirectIoFs {
    /// Wrap `inner` using [`DEFAULT_BLOCK_SIZE`].
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self::with_block_size(inner, DEFAULT_BLOCK_SIZE)
    }

    /// Wrap `inner` with an explicit block size.
    ///
    /// `block_size` must be a power of two and at least
    /// [`MIN_BLOCK_SIZE`]; out-of-range values fall back to the default.
    pub fn with_block_size(inner: Arc<dyn FileSystem>, block_size: usize) -> Self {
        let block_size = if block_size >= MIN_BLOCK_SIZE && block_size.is_power_of_two() {
            block_size
        } else {
            DEFAULT_BLOCK_SIZE
        };
        Self { inner, block_size }
    }

    /// The logical block size this wrapper enforces.
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl FileSystem for DirectIoFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let inner = self.inner.create(path)?;
        Ok(Box::new(DirectWritableFile {
            inner,
            buffer: Vec::new(),
            block_size: self.block_size,
        }))
    }

    fn open_sequential(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        self.inner.open_sequential(path)
    }

    fn open_random(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>> {
        let inner = self.inner.open_random(path)?;
        Ok(Arc::new(DirectRandomFile {
            inner,
            block_size: self.block_size,
        }))
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        self.inner.rename(src, dst)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_all(path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.mkdir_all(path)
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        self.inner.truncate(path, size)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.inner.stat(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.list_dir(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.sync_dir(path)
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn FileLock>, LockError> {
        self.inner.lock(path)
    }
}

// ------------------------------------------------------------------------------------------------
// Wrapped handles
// ------------------------------------------------------------------------------------------------

struct DirectWritableFile {
    inner: Box<dyn WritableFile>,
    /// Bytes not yet pushed to the wrapped file; always shorter than one
    /// block between calls.
    buffer: Vec<u8>,
    block_size: usize,
}

impl DirectWritableFile {
    fn push_aligned(&mut self) -> io::Result<()> {
        let aligned = align_down(self.buffer.len() as u64, self.block_size as u64) as usize;
        if aligned > 0 {
            self.inner.append(&self.buffer[..aligned])?;
            self.buffer.drain(..aligned);
        }
        Ok(())
    }

    fn push_tail(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.inner.append(&tail)?;
        }
        Ok(())
    }
}

impl WritableFile for DirectWritableFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(data);
        self.push_aligned()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.push_aligned()?;
        self.inner.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        // A sync makes everything written so far durable, so the
        // unaligned tail must go through as well.
        self.push_tail()?;
        self.inner.sync()
    }

    fn size(&self) -> u64 {
        self.inner.size() + self.buffer.len() as u64
    }

    fn close(&mut self) -> io::Result<()> {
        self.push_tail()?;
        self.inner.close()
    }
}

struct DirectRandomFile {
    inner: Arc<dyn RandomAccessFile>,
    block_size: usize,
}

impl RandomAccessFile for DirectRandomFile {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let align = self.block_size as u64;
        if !is_aligned(offset, align) {
            return Err(misaligned("offset", offset, self.block_size));
        }
        if !is_aligned(len as u64, align) {
            return Err(misaligned("length", len as u64, self.block_size));
        }
        self.inner.read_at(offset, len)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

// ------------------------------------------------------------------------------------------------
// Byte-granular adapter
// ------------------------------------------------------------------------------------------------

/// Serves arbitrary byte ranges on top of an alignment-requiring file by
/// reading the aligned superset and slicing.
pub struct AlignedReads {
    inner: Arc<dyn RandomAccessFile>,
    block_size: usize,
}

impl std::fmt::Debug for AlignedReads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedReads")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl AlignedReads {
    /// Wrap an alignment-requiring reader.
    pub fn new(inner: Arc<dyn RandomAccessFile>, block_size: usize) -> Self {
        Self { inner, block_size }
    }
}

impl RandomAccessFile for AlignedReads {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let align = self.block_size as u64;
        let aligned_start = align_down(offset, align);
        let aligned_end = align_up(offset + len as u64, align);
        let data = self
            .inner
            .read_at(aligned_start, (aligned_end - aligned_start) as usize)?;

        let skip = (offset - aligned_start) as usize;
        if skip >= data.len() {
            return Ok(Vec::new());
        }
        let end = (skip + len).min(data.len());
        Ok(data[skip..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

/// Compose strict alignment enforcement with the byte-granular adapter:
/// the result accepts any `read_at` while the underlying file only ever
/// sees aligned requests.
pub fn aligned_reader(
    inner: Arc<dyn RandomAccessFile>,
    block_size: usize,
) -> Arc<dyn RandomAccessFile> {
    let strict = Arc::new(DirectRandomFile { inner, block_size });
    Arc::new(AlignedReads::new(strict, block_size))
}
