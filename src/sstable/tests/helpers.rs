use std::path::Path;

use crate::keys::{InternalKey, SequenceNumber, ValueKind};
use crate::memtable::RangeTombstone;
use crate::sstable::{Table, TableBuilder};
use crate::vfs::{FileSystem, StdFs};

/// `(user_key, sequence, kind, value)` source row for table fixtures.
pub type Row = (Vec<u8>, SequenceNumber, ValueKind, Vec<u8>);

/// Sort rows into internal-key order.
pub fn sort_rows(rows: &mut [Row]) {
    rows.sort_by(|a, b| {
        InternalKey::new(&a.0, a.1, a.2).cmp(&InternalKey::new(&b.0, b.1, b.2))
    });
}

/// Build a table at `path` from rows (sorted internally) and tombstones.
pub fn build_table(path: &Path, mut rows: Vec<Row>, tombstones: &[RangeTombstone]) {
    sort_rows(&mut rows);
    let file = StdFs.create(path).expect("create table file");
    let mut builder = TableBuilder::with_params(file, 256, 4);
    for (user_key, seq, kind, value) in &rows {
        builder
            .add(&InternalKey::new(user_key, *seq, *kind), value)
            .expect("add");
    }
    builder.add_range_tombstones(tombstones).expect("tombstones");
    builder.finish().expect("finish");
    builder.sync().expect("sync");
    builder.close().expect("close");
}

/// Open the table at `path`.
pub fn open_table(path: &Path) -> Table {
    let size = StdFs.stat(path).expect("stat").size;
    let file = StdFs.open_random(path).expect("open");
    Table::open(file, size).expect("table open")
}

/// Open the table, returning the error if validation fails.
pub fn try_open_table(path: &Path) -> Result<Table, crate::sstable::SstError> {
    let size = StdFs.stat(path).expect("stat").size;
    let file = StdFs.open_random(path).expect("open");
    Table::open(file, size)
}

/// A deterministic fixture of `n` put rows (`key-0000` …) at sequences
/// `1..=n`.
pub fn put_rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            (
                format!("key-{i:04}").into_bytes(),
                (i + 1) as u64,
                ValueKind::Value,
                format!("value-{i:04}").into_bytes(),
            )
        })
        .collect()
}

/// Collect all entries of a table into `(user_key, seq, kind, value)` rows.
pub fn scan_table(table: &Table) -> Vec<Row> {
    let mut iter = table.iter();
    let mut rows = Vec::new();
    while let Some((key, value)) = iter.next_entry().expect("scan") {
        rows.push((key.user_key().to_vec(), key.sequence(), key.kind(), value));
    }
    rows
}

/// On-disk size of a table file.
pub fn file_size(path: &Path) -> u64 {
    StdFs.stat(path).unwrap().size
}
