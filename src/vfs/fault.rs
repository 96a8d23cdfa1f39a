//! Fault-injection filesystem.
//!
//! [`FaultFs`] decorates another [`FileSystem`] and records, for every
//! file it touches, how many bytes have been made durable via `sync` and
//! which renames have not yet been pinned down by a directory sync. The
//! crash tests then simulate power loss without killing the process:
//!
//! - [`FaultFs::drop_unsynced_data`] — truncate each file back to its
//!   last-synced length.
//! - [`FaultFs::revert_unsynced_renames`] — undo any rename whose parent
//!   directory was not synced after the rename.
//! - [`FaultFs::delete_unsynced_files`] — remove files that were created
//!   but never fsync'd.
//!
//! Independent error injection is available per path
//! ([`inject_read_error`](FaultFs::inject_read_error),
//! [`inject_write_error`](FaultFs::inject_write_error)), for all syncs
//! ([`inject_sync_error`](FaultFs::inject_sync_error)), as a probabilistic
//! one-in-N write-failure rate, and as a global off switch
//! ([`set_filesystem_active`](FaultFs::set_filesystem_active)) that makes
//! every subsequent mutation fail — the moment of "power loss".
//!
//! The injection context lives on the `FaultFs` instance and is shared by
//! every handle it hands out; concurrent workers each talk to the
//! instance they were given rather than to thread-local state.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{
    FileLock, FileStat, FileSystem, LockError, RandomAccessFile, SequentialFile, WritableFile,
};

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct FileFaultState {
    /// Bytes guaranteed durable by the last successful sync.
    synced_size: u64,
    /// Bytes written so far (durable or not).
    size: u64,
    /// Whether this file was created through the wrapper.
    created: bool,
    /// Whether `sync` ever succeeded on this file.
    ever_synced: bool,
}

#[derive(Debug, Default)]
struct FaultState {
    files: HashMap<PathBuf, FileFaultState>,
    /// Renames applied to the inner filesystem whose parent directory has
    /// not been synced since.
    pending_renames: Vec<(PathBuf, PathBuf)>,
    read_errors: HashSet<PathBuf>,
    write_errors: HashSet<PathBuf>,
}

#[derive(Debug, Default)]
struct Flags {
    /// When false, every mutation (and read) fails; simulates the device
    /// disappearing at the moment of a crash.
    active: AtomicBool,
    /// When true, every `sync`/`sync_dir` fails.
    sync_error: AtomicBool,
    /// When non-zero, one in N writes fails (counter-driven, so the
    /// schedule is deterministic for a given operation sequence).
    write_error_one_in: AtomicU32,
    op_counter: AtomicU64,
}

fn injected(kind: &str, path: &Path) -> io::Error {
    io::Error::other(format!("injected {kind} error: {}", path.display()))
}

fn inactive() -> io::Error {
    io::Error::other("filesystem deactivated by fault injection")
}

// ------------------------------------------------------------------------------------------------
// FaultFs
// ------------------------------------------------------------------------------------------------

/// Fault-injection wrapper around another [`FileSystem`].
///
/// Cloning shares the same fault context; handles created from any clone
/// observe the same injected failures and crash simulations.
#[derive(Clone)]
pub struct FaultFs {
    inner: Arc<dyn FileSystem>,
    state: Arc<Mutex<FaultState>>,
    flags: Arc<Flags>,
}

impl std::fmt::Debug for FaultFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultFs")
            .field("active", &self.flags.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FaultFs {
    /// Wrap `inner` with a fresh fault context (active, no injected
    /// errors).
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        let flags = Flags::default();
        flags.active.store(true, Ordering::Release);
        Self {
            inner,
            state: Arc::new(Mutex::new(FaultState::default())),
            flags: Arc::new(flags),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FaultState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn active(&self) -> bool {
        self.flags.active.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------
    // Crash simulation
    // --------------------------------------------------------------------

    /// Truncate every tracked file back to its last-synced length and
    /// forget in-memory unsynced writes.
    pub fn drop_unsynced_data(&self) -> io::Result<()> {
        let mut state = self.lock_state();
        for (path, file) in state.files.iter_mut() {
            if file.size > file.synced_size && self.inner.exists(path) {
                self.inner.truncate(path, file.synced_size)?;
                debug!(
                    path = %path.display(),
                    from = file.size,
                    to = file.synced_size,
                    "dropped unsynced data"
                );
                file.size = file.synced_size;
            }
        }
        info!("fault fs: dropped all unsynced data");
        Ok(())
    }

    /// Reverse any rename whose parent directory was not synced after the
    /// rename.
    pub fn revert_unsynced_renames(&self) -> io::Result<()> {
        let mut state = self.lock_state();
        let pending = std::mem::take(&mut state.pending_renames);
        for (src, dst) in pending.into_iter().rev() {
            self.inner.rename(&dst, &src)?;
            if let Some(entry) = state.files.remove(&dst) {
                state.files.insert(src.clone(), entry);
            }
            debug!(src = %src.display(), dst = %dst.display(), "reverted unsynced rename");
        }
        Ok(())
    }

    /// Remove files that were created through this wrapper but never
    /// fsync'd.
    pub fn delete_unsynced_files(&self) -> io::Result<()> {
        let mut state = self.lock_state();
        let doomed: Vec<PathBuf> = state
            .files
            .iter()
            .filter(|(_, file)| file.created && !file.ever_synced)
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            if self.inner.exists(&path) {
                self.inner.remove(&path)?;
            }
            state.files.remove(&path);
            debug!(path = %path.display(), "deleted never-synced file");
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Error injection
    // --------------------------------------------------------------------

    /// Make every read of `path` fail until cleared.
    pub fn inject_read_error(&self, path: &Path) {
        self.lock_state().read_errors.insert(path.to_path_buf());
    }

    /// Make every write to `path` fail until cleared.
    pub fn inject_write_error(&self, path: &Path) {
        self.lock_state().write_errors.insert(path.to_path_buf());
    }

    /// Make every sync (file and directory) fail until cleared.
    pub fn inject_sync_error(&self) {
        self.flags.sync_error.store(true, Ordering::Release);
    }

    /// Fail one in `n` write operations (0 disables the rate).
    pub fn set_write_error_one_in(&self, n: u32) {
        self.flags.write_error_one_in.store(n, Ordering::Release);
    }

    /// Clear all injected per-path and sync errors.
    pub fn clear_injected_errors(&self) {
        let mut state = self.lock_state();
        state.read_errors.clear();
        state.write_errors.clear();
        drop(state);
        self.flags.sync_error.store(false, Ordering::Release);
        self.flags.write_error_one_in.store(0, Ordering::Release);
    }

    /// Turn the filesystem on or off. While off, every operation fails.
    pub fn set_filesystem_active(&self, active: bool) {
        self.flags.active.store(active, Ordering::Release);
        info!(active, "fault fs activity toggled");
    }

    // --------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------

    /// Number of renames not yet pinned by a directory sync.
    pub fn pending_rename_count(&self) -> usize {
        self.lock_state().pending_renames.len()
    }

    /// Whether any rename is still unpinned.
    pub fn has_pending_renames(&self) -> bool {
        self.pending_rename_count() > 0
    }

    /// The durable (last-synced) size recorded for `path`, if tracked.
    pub fn synced_size(&self, path: &Path) -> Option<u64> {
        self.lock_state().files.get(path).map(|f| f.synced_size)
    }

    fn should_fail_write(&self, path: &Path) -> bool {
        if self.lock_state().write_errors.contains(path) {
            return true;
        }
        let one_in = self.flags.write_error_one_in.load(Ordering::Acquire);
        if one_in == 0 {
            return false;
        }
        let tick = self.flags.op_counter.fetch_add(1, Ordering::AcqRel);
        tick % u64::from(one_in) == u64::from(one_in) - 1
    }
}

impl FileSystem for FaultFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        if !self.active() {
            return Err(inactive());
        }
        let inner = self.inner.create(path)?;
        let mut state = self.lock_state();
        state.files.insert(
            path.to_path_buf(),
            FileFaultState {
                created: true,
                ..FileFaultState::default()
            },
        );
        drop(state);
        Ok(Box::new(FaultWritableFile {
            inner,
            path: path.to_path_buf(),
            fs: self.clone(),
        }))
    }

    fn open_sequential(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        if !self.active() {
            return Err(inactive());
        }
        if self.lock_state().read_errors.contains(path) {
            return Err(injected("read", path));
        }
        let inner = self.inner.open_sequential(path)?;
        Ok(Box::new(FaultSequentialFile {
            inner,
            path: path.to_path_buf(),
            fs: self.clone(),
        }))
    }

    fn open_random(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>> {
        if !self.active() {
            return Err(inactive());
        }
        if self.lock_state().read_errors.contains(path) {
            return Err(injected("read", path));
        }
        let inner = self.inner.open_random(path)?;
        Ok(Arc::new(FaultRandomFile {
            inner,
            path: path.to_path_buf(),
            fs: self.clone(),
        }))
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if !self.active() {
            return Err(inactive());
        }
        self.inner.rename(src, dst)?;
        let mut state = self.lock_state();
        if let Some(entry) = state.files.remove(src) {
            state.files.insert(dst.to_path_buf(), entry);
        }
        state
            .pending_renames
            .push((src.to_path_buf(), dst.to_path_buf()));
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if !self.active() {
            return Err(inactive());
        }
        self.inner.remove(path)?;
        let mut state = self.lock_state();
        state.files.remove(path);
        state.pending_renames.retain(|(_, dst)| dst != path);
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        if !self.active() {
            return Err(inactive());
        }
        self.inner.remove_all(path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        if !self.active() {
            return Err(inactive());
        }
        self.inner.mkdir_all(path)
    }

    fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        if !self.active() {
            return Err(inactive());
        }
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
        if !self.active() {
            return Err(inactive());
        }
        if self.flags.sync_error.load(Ordering::Acquire) {
            return Err(injected("sync", path));
        }
        self.inner.sync_dir(path)?;
        // Renames inside this directory are now pinned.
        self.lock_state()
            .pending_renames
            .retain(|(_, dst)| dst.parent() != Some(path));
        Ok(())
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn FileLock>, LockError> {
        if !self.active() {
            return Err(LockError::Io(inactive()));
        }
        self.inner.lock(path)
    }
}

// ------------------------------------------------------------------------------------------------
// Wrapped handles
// ------------------------------------------------------------------------------------------------

struct FaultWritableFile {
    inner: Box<dyn WritableFile>,
    path: PathBuf,
    fs: FaultFs,
}

impl WritableFile for FaultWritableFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.fs.active() {
            return Err(inactive());
        }
        if self.fs.should_fail_write(&self.path) {
            return Err(injected("write", &self.path));
        }
        self.inner.append(data)?;
        if let Some(file) = self.fs.lock_state().files.get_mut(&self.path) {
            file.size += data.len() as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.fs.active() {
            return Err(inactive());
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> io::Result<()> {
        if !self.fs.active() {
            return Err(inactive());
        }
        if self.fs.flags.sync_error.load(Ordering::Acquire) {
            return Err(injected("sync", &self.path));
        }
        self.inner.sync()?;
        if let Some(file) = self.fs.lock_state().files.get_mut(&self.path) {
            file.synced_size = file.size;
            file.ever_synced = true;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn close(&mut self) -> io::Result<()> {
        // Close flushes buffered bytes into the OS but does not make them
        // durable; the tracked synced_size is deliberately untouched.
        if !self.fs.active() {
            return Ok(());
        }
        self.inner.close()
    }
}

struct FaultSequentialFile {
    inner: Box<dyn SequentialFile>,
    path: PathBuf,
    fs: FaultFs,
}

impl SequentialFile for FaultSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.fs.active() {
            return Err(inactive());
        }
        if self.fs.lock_state().read_errors.contains(&self.path) {
            return Err(injected("read", &self.path));
        }
        self.inner.read(buf)
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        self.inner.skip(n)
    }
}

struct FaultRandomFile {
    inner: Arc<dyn RandomAccessFile>,
    path: PathBuf,
    fs: FaultFs,
}

impl RandomAccessFile for FaultRandomFile {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if !self.fs.active() {
            return Err(inactive());
        }
        if self.fs.lock_state().read_errors.contains(&self.path) {
            return Err(injected("read", &self.path));
        }
        self.inner.read_at(offset, len)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}
