//! Direct-I/O decorator tests: alignment helpers and enforcement.

#[cfg(test)]
mod tests {
    use crate::vfs::direct::{
        DEFAULT_BLOCK_SIZE, DirectIoFs, align_down, align_up, is_aligned,
    };
    use crate::vfs::{
        FileSystem, RandomAccessFile as _, StdFs, WritableFile as _, read_file_to_vec,
    };
    use std::io::ErrorKind;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn alignment_helpers() {
        assert!(is_aligned(0, 512));
        assert!(is_aligned(4096, 512));
        assert!(!is_aligned(513, 512));
        assert!(!is_aligned(1, 0), "zero alignment is never aligned");

        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_up(4097, 4096), 8192);

        assert_eq!(align_down(0, 512), 0);
        assert_eq!(align_down(511, 512), 0);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn invalid_block_size_falls_back_to_default() {
        let fs = DirectIoFs::with_block_size(Arc::new(StdFs), 100);
        assert_eq!(fs.block_size(), DEFAULT_BLOCK_SIZE);
        let fs = DirectIoFs::with_block_size(Arc::new(StdFs), 256);
        assert_eq!(fs.block_size(), DEFAULT_BLOCK_SIZE, "below MIN_BLOCK_SIZE");
        let fs = DirectIoFs::with_block_size(Arc::new(StdFs), 512);
        assert_eq!(fs.block_size(), 512);
    }

    #[test]
    fn misaligned_reads_are_rejected() {
        let dir = TempDir::new().unwrap();
        let fs = DirectIoFs::with_block_size(Arc::new(StdFs), 512);
        let path = dir.path().join("file");

        let mut file = fs.create(&path).unwrap();
        file.append(&vec![7u8; 2048]).unwrap();
        file.sync().unwrap();
        file.close().unwrap();

        let reader = fs.open_random(&path).unwrap();
        assert_eq!(reader.read_at(0, 512).unwrap().len(), 512);
        assert_eq!(reader.read_at(512, 1024).unwrap().len(), 1024);

        let err = reader.read_at(100, 512).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = reader.read_at(512, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn buffered_writer_preserves_exact_contents() {
        let dir = TempDir::new().unwrap();
        let fs = DirectIoFs::with_block_size(Arc::new(StdFs), 512);
        let path = dir.path().join("file");

        // 1500 bytes: two full blocks go through early, a 476-byte tail
        // lands at close.
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let mut file = fs.create(&path).unwrap();
        for chunk in payload.chunks(100) {
            file.append(chunk).unwrap();
        }
        assert_eq!(file.size(), 1500);
        file.close().unwrap();

        assert_eq!(read_file_to_vec(&fs, &path).unwrap(), payload);
    }

    #[test]
    fn aligned_reader_serves_arbitrary_ranges_through_strict_alignment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
        {
            let mut file = StdFs.create(&path).unwrap();
            file.append(&payload).unwrap();
            file.sync().unwrap();
        }

        let raw = StdFs.open_random(&path).unwrap();
        let reader = crate::vfs::direct::aligned_reader(raw, 512);

        assert_eq!(reader.read_at(0, 10).unwrap(), &payload[0..10]);
        assert_eq!(reader.read_at(700, 300).unwrap(), &payload[700..1000]);
        assert_eq!(reader.read_at(2990, 100).unwrap(), &payload[2990..3000]);
        assert!(reader.read_at(5000, 10).unwrap().is_empty());
    }

    #[test]
    fn sync_pushes_unaligned_tail() {
        let dir = TempDir::new().unwrap();
        let fs = DirectIoFs::with_block_size(Arc::new(StdFs), 512);
        let path = dir.path().join("file");

        let mut file = fs.create(&path).unwrap();
        file.append(b"tiny").unwrap();
        file.sync().unwrap();

        assert_eq!(StdFs.stat(&path).unwrap().size, 4);
    }
}
