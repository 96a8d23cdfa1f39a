//! Standard-filesystem contract tests: create/append/sync/size semantics,
//! sequential and random reads, directory ops, and the advisory lock.

#[cfg(test)]
mod tests {
    use crate::vfs::{
        FileLock as _, FileSystem, LockError, RandomAccessFile as _, SequentialFile as _,
        StdFs, WritableFile as _, read_file_to_vec, write_file_synced,
    };
    use tempfile::TempDir;

    #[test]
    fn writable_file_reports_buffered_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let fs = StdFs;

        let mut file = fs.create(&path).unwrap();
        assert_eq!(file.size(), 0);
        file.append(b"hello ").unwrap();
        file.append(b"world").unwrap();
        assert_eq!(file.size(), 11);
        file.sync().unwrap();
        file.close().unwrap();

        assert_eq!(fs.stat(&path).unwrap().size, 11);
        assert_eq!(read_file_to_vec(&fs, &path).unwrap(), b"hello world");
    }

    #[test]
    fn create_truncates_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let fs = StdFs;

        write_file_synced(&fs, &path, b"old contents that are long").unwrap();
        write_file_synced(&fs, &path, b"new").unwrap();
        assert_eq!(read_file_to_vec(&fs, &path).unwrap(), b"new");
    }

    #[test]
    fn sequential_read_and_skip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let fs = StdFs;
        write_file_synced(&fs, &path, b"0123456789").unwrap();

        let mut file = fs.open_sequential(&path).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"012");
        file.skip(4).unwrap();
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"789");
        assert_eq!(file.read(&mut buf).unwrap(), 0, "EOF");
    }

    #[test]
    fn random_read_clamps_to_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let fs = StdFs;
        write_file_synced(&fs, &path, b"abcdef").unwrap();

        let file = fs.open_random(&path).unwrap();
        assert_eq!(file.size(), 6);
        assert_eq!(file.read_at(2, 3).unwrap(), b"cde");
        assert_eq!(file.read_at(4, 100).unwrap(), b"ef");
        assert!(file.read_at(100, 4).unwrap().is_empty());
    }

    #[test]
    fn random_read_of_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        let fs = StdFs;
        write_file_synced(&fs, &path, b"").unwrap();

        let file = fs.open_random(&path).unwrap();
        assert_eq!(file.size(), 0);
        assert!(file.read_at(0, 16).unwrap().is_empty());
    }

    #[test]
    fn rename_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let fs = StdFs;
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write_file_synced(&fs, &src, b"fresh").unwrap();
        write_file_synced(&fs, &dst, b"stale").unwrap();

        fs.rename(&src, &dst).unwrap();
        assert!(!fs.exists(&src));
        assert_eq!(read_file_to_vec(&fs, &dst).unwrap(), b"fresh");
    }

    #[test]
    fn list_dir_returns_sorted_entries() {
        let dir = TempDir::new().unwrap();
        let fs = StdFs;
        for name in ["b", "a", "c"] {
            write_file_synced(&fs, &dir.path().join(name), b"x").unwrap();
        }
        let listed = fs.list_dir(dir.path()).unwrap();
        let names: Vec<_> = listed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn truncate_discards_tail() {
        let dir = TempDir::new().unwrap();
        let fs = StdFs;
        let path = dir.path().join("file");
        write_file_synced(&fs, &path, b"0123456789").unwrap();
        fs.truncate(&path, 4).unwrap();
        assert_eq!(read_file_to_vec(&fs, &path).unwrap(), b"0123");
    }

    #[test]
    fn second_lock_on_same_path_fails() {
        let dir = TempDir::new().unwrap();
        let fs = StdFs;
        let path = dir.path().join("LOCK");

        let mut first = fs.lock(&path).unwrap();
        match fs.lock(&path) {
            Err(LockError::AlreadyLocked) => {}
            Err(other) => panic!("expected AlreadyLocked, got Err({other:?})"),
            Ok(_) => panic!("expected AlreadyLocked, got Ok"),
        }

        first.release().unwrap();
        let _second = fs.lock(&path).unwrap();
    }
}
