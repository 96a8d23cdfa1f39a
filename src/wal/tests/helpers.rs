use std::path::Path;

use crate::vfs::{FileSystem, StdFs};
use crate::wal::{LogReader, LogWriter};

/// Create a log at `path` containing the given records, synced.
pub fn write_log(path: &Path, records: &[Vec<u8>]) {
    let file = StdFs.create(path).expect("create log");
    let mut writer = LogWriter::new(file);
    for record in records {
        writer.add_record(record).expect("add record");
    }
    writer.sync().expect("sync");
    writer.close().expect("close");
}

/// Open a reader over `path`.
pub fn open_reader(path: &Path, strict: bool) -> LogReader {
    let file = StdFs.open_sequential(path).expect("open log");
    LogReader::new(file, strict)
}

/// Drain every record a tolerant reader yields.
pub fn read_all(path: &Path) -> (Vec<Vec<u8>>, crate::wal::EndOfLog) {
    let mut reader = open_reader(path, false);
    let mut records = Vec::new();
    while let Some(record) = reader.read_record().expect("tolerant read") {
        records.push(record);
    }
    (records, reader.end_of_log().clone())
}

/// A record of `len` bytes with a position-dependent pattern seeded by `seed`.
pub fn patterned(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Truncate the file at `path` to `len` bytes.
pub fn truncate_to(path: &Path, len: u64) {
    StdFs.truncate(path, len).expect("truncate");
}

/// Flip one byte at `offset`.
pub fn flip_byte(path: &Path, offset: u64) {
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}
