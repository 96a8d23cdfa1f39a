//! Database-directory file naming.
//!
//! All state lives in one directory:
//!
//! | Name | Contents |
//! |------|----------|
//! | `CURRENT` | one line naming the active manifest |
//! | `LOCK` | advisory lock file, empty |
//! | `MANIFEST-<n>` | version-edit log |
//! | `<n>.sst` | sorted table |
//! | `<n>.log` | write-ahead log |
//! | `CURRENT.tmp` | staging file for atomic CURRENT replacement |
//!
//! `<n>` is a file number rendered as six zero-padded decimal digits
//! (wider when it overflows six). Parsing accepts any digit count.

use std::path::{Path, PathBuf};

/// The file naming the active manifest.
pub const CURRENT: &str = "CURRENT";

/// The advisory lock file.
pub const LOCK: &str = "LOCK";

/// Staging name for atomic CURRENT replacement.
pub const CURRENT_TMP: &str = "CURRENT.tmp";

/// What a directory entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// `CURRENT`
    Current,
    /// `CURRENT.tmp`
    CurrentTmp,
    /// `LOCK`
    Lock,
    /// `MANIFEST-<n>`
    Manifest(u64),
    /// `<n>.sst`
    Table(u64),
    /// `<n>.log`
    WriteAheadLog(u64),
}

/// `CURRENT` path inside `db_path`.
pub fn current_file_name(db_path: &Path) -> PathBuf {
    db_path.join(CURRENT)
}

/// `CURRENT.tmp` path inside `db_path`.
pub fn current_tmp_file_name(db_path: &Path) -> PathBuf {
    db_path.join(CURRENT_TMP)
}

/// `LOCK` path inside `db_path`.
pub fn lock_file_name(db_path: &Path) -> PathBuf {
    db_path.join(LOCK)
}

/// `MANIFEST-<n>` path inside `db_path`.
pub fn manifest_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(manifest_base_name(number))
}

/// Bare `MANIFEST-<n>` name (the CURRENT file's contents, minus newline).
pub fn manifest_base_name(number: u64) -> String {
    format!("MANIFEST-{number:06}")
}

/// `<n>.sst` path inside `db_path`.
pub fn table_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{number:06}.sst"))
}

/// `<n>.log` path inside `db_path`.
pub fn log_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{number:06}.log"))
}

/// Classify a bare file name (no directory components).
pub fn parse_file_name(name: &str) -> Option<FileKind> {
    match name {
        CURRENT => return Some(FileKind::Current),
        CURRENT_TMP => return Some(FileKind::CurrentTmp),
        LOCK => return Some(FileKind::Lock),
        _ => {}
    }
    if let Some(digits) = name.strip_prefix("MANIFEST-") {
        return digits.parse().ok().map(FileKind::Manifest);
    }
    if let Some(digits) = name.strip_suffix(".sst") {
        return digits.parse().ok().map(FileKind::Table);
    }
    if let Some(digits) = name.strip_suffix(".log") {
        return digits.parse().ok().map(FileKind::WriteAheadLog);
    }
    None
}

/// Validate one line of CURRENT: trims trailing whitespace, requires the
/// `MANIFEST-` prefix, digits, and no path separators. Returns the
/// manifest number.
pub fn parse_current_contents(contents: &str) -> Option<u64> {
    let trimmed = contents.trim_end();
    if trimmed.contains(['/', '\\']) {
        return None;
    }
    let digits = trimmed.strip_prefix("MANIFEST-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
