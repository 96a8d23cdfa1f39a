use std::path::Path;
use std::sync::Arc;

use crate::keys::{InternalKey, ValueKind};
use crate::manifest::{FileMetaData, VersionEdit, VersionSet};
use crate::vfs::{FileSystem, StdFs};

pub const TEST_LEVELS: usize = 7;

/// A version set over `StdFs` rooted at `db_path`.
pub fn version_set(db_path: &Path) -> VersionSet {
    StdFs.mkdir_all(db_path).expect("mkdir");
    VersionSet::new(Arc::new(StdFs), db_path, TEST_LEVELS)
}

/// A bootstrapped (CURRENT + manifest present) version set.
pub fn bootstrapped(db_path: &Path) -> VersionSet {
    let mut vset = version_set(db_path);
    vset.bootstrap().expect("bootstrap");
    vset
}

/// Fabricate file metadata covering `[small, large]` at `level`.
pub fn file_meta(number: u64, level: u32, small: &[u8], large: &[u8], seqno: u64) -> FileMetaData {
    FileMetaData {
        file_number: number,
        level,
        file_size: 1024,
        smallest: InternalKey::new(small, seqno, ValueKind::Value),
        largest: InternalKey::new(large, seqno.saturating_sub(1).max(1), ValueKind::Value),
        smallest_seqno: seqno.saturating_sub(1).max(1),
        largest_seqno: seqno,
    }
}

/// Touch an empty `<n>.sst` so recovery's existence check passes.
pub fn touch_table_file(db_path: &Path, number: u64) {
    let path = crate::filenames::table_file_name(db_path, number);
    crate::vfs::write_file_synced(&StdFs, &path, b"").expect("touch table");
}

/// Apply an edit adding `file` (touching its on-disk name first).
pub fn install_file(vset: &mut VersionSet, db_path: &Path, file: FileMetaData) {
    touch_table_file(db_path, file.file_number);
    let mut edit = VersionEdit {
        new_files: vec![file],
        ..VersionEdit::default()
    };
    vset.log_and_apply(&mut edit).expect("log_and_apply");
}
