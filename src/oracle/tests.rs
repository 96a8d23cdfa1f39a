//! Oracle tests: bit packing, pending-operation resolution, snapshot and
//! trace round trips, replay bounded by sequence number.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::oracle::*;
    use tempfile::TempDir;

    #[test]
    fn slots__fresh_state_is_all_deleted() {
        let state = ExpectedState::new(2, 100);
        for cf in 0..2 {
            for key in [0u64, 50, 99] {
                assert!(!state.exists(cf, key));
                assert_eq!(state.value_base(cf, key), None);
            }
        }
    }

    #[test]
    fn slots__put_then_delete_lifecycle() {
        let state = ExpectedState::new(1, 10);

        state.begin_put(0, 3, 7).commit();
        assert!(state.exists(0, 3));
        assert_eq!(state.value_base(0, 3), Some(7));

        state.begin_delete(0, 3).commit();
        assert!(!state.exists(0, 3));
        assert_eq!(state.state(0, 3).del_counter, 1);

        state.begin_put(0, 3, 8).commit();
        assert_eq!(state.value_base(0, 3), Some(8));
    }

    #[test]
    fn slots__bit_packing_round_trips_extremes() {
        let state = ExpectedState::new(1, 1);
        state.begin_put(0, 0, 0x7fff).commit();
        for _ in 0..5 {
            state.begin_delete(0, 0).commit();
            state.begin_put(0, 0, 0x7fff).commit();
        }
        let slot = state.state(0, 0);
        assert_eq!(slot.value_base, 0x7fff);
        assert_eq!(slot.del_counter, 5);
        assert!(!slot.deleted);
    }

    #[test]
    fn pending__uncommitted_put_resolves_to_present() {
        let state = ExpectedState::new(1, 10);
        let pending = state.begin_put(0, 1, 9);
        // Crash before acknowledgement: guard dropped without commit.
        drop(pending);
        assert!(state.state(0, 1).pending_write);

        state.resolve_pending();
        let slot = state.state(0, 1);
        assert!(!slot.pending_write);
        assert!(!slot.deleted, "conservative persistence assumes completion");
        assert_eq!(state.value_base(0, 1), Some(9));
    }

    #[test]
    fn pending__uncommitted_delete_resolves_to_absent() {
        let state = ExpectedState::new(1, 10);
        state.begin_put(0, 1, 4).commit();
        drop(state.begin_delete(0, 1));

        state.resolve_pending();
        assert!(!state.exists(0, 1));
        assert_eq!(state.state(0, 1).del_counter, 1);
    }

    #[test]
    fn snapshot__save_load_round_trip_resolves_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expected_state.bin");

        let state = ExpectedState::new(2, 64);
        state.begin_put(0, 5, 11).commit();
        state.begin_put(1, 63, 0x7000).commit();
        state.begin_delete(0, 5).commit();
        drop(state.begin_put(1, 7, 3)); // stranded pending
        state.set_seqno(999);
        state.save(&path).unwrap();

        let loaded = ExpectedState::load(&path).unwrap();
        assert_eq!(loaded.num_cfs(), 2);
        assert_eq!(loaded.max_key(), 64);
        assert_eq!(loaded.seqno(), 999);
        assert!(!loaded.exists(0, 5));
        assert_eq!(loaded.value_base(1, 63), Some(0x7000));
        assert_eq!(loaded.value_base(1, 7), Some(3), "pending put resolved present");
    }

    #[test]
    fn snapshot__header_layout_is_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expected_state.bin");
        let state = ExpectedState::new(3, 17);
        state.set_seqno(0x0102_0304);
        state.save(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], b"EXSTATE2");
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &3u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &17u64.to_le_bytes());
        assert_eq!(&bytes[28..36], &0x0102_0304u64.to_le_bytes());
        assert_eq!(bytes.len(), 36 + 3 * 17 * 4);
    }

    #[test]
    fn snapshot__damage_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expected_state.bin");
        let state = ExpectedState::new(1, 8);
        state.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            ExpectedState::load(&path),
            Err(OracleError::Corruption(_))
        ));

        std::fs::write(&path, b"EXSTATE2short").unwrap();
        assert!(ExpectedState::load(&path).is_err());
    }

    #[test]
    fn trace__records_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.trace");
        let header = TraceHeader { start_seq: 10, num_cfs: 1, max_key: 100 };

        let records = vec![
            TraceRecord { op: TraceOp::Put, cf: 0, key: 4, value_base: 1, seqno: 11 },
            TraceRecord { op: TraceOp::Delete, cf: 0, key: 4, value_base: 0, seqno: 12 },
            TraceRecord { op: TraceOp::Put, cf: 0, key: 9, value_base: 2, seqno: 13 },
        ];
        let mut writer = TraceWriter::create(&path, header).unwrap();
        for record in &records {
            writer.append(*record).unwrap();
        }
        writer.sync().unwrap();

        let mut reader = TraceReader::open(&path).unwrap();
        assert_eq!(reader.header(), header);
        let mut seen = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            seen.push(record);
        }
        assert_eq!(seen, records);
    }

    #[test]
    fn trace__torn_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.trace");
        let header = TraceHeader { start_seq: 0, num_cfs: 1, max_key: 10 };
        let mut writer = TraceWriter::create(&path, header).unwrap();
        writer
            .append(TraceRecord { op: TraceOp::Put, cf: 0, key: 1, value_base: 1, seqno: 1 })
            .unwrap();
        writer
            .append(TraceRecord { op: TraceOp::Put, cf: 0, key: 2, value_base: 1, seqno: 2 })
            .unwrap();
        writer.sync().unwrap();

        // Cut the second record in half.
        let full = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 12).unwrap();

        let mut reader = TraceReader::open(&path).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn replay__stops_at_recovered_seqno() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.trace");
        let header = TraceHeader { start_seq: 0, num_cfs: 1, max_key: 10 };
        let mut writer = TraceWriter::create(&path, header).unwrap();
        for seqno in 1..=6u64 {
            writer
                .append(TraceRecord {
                    op: TraceOp::Put,
                    cf: 0,
                    key: seqno % 3,
                    value_base: seqno as u32,
                    seqno,
                })
                .unwrap();
        }
        writer.sync().unwrap();

        // Crash "recovered" only up to seqno 4.
        let state = ExpectedState::new(1, 10);
        let mut reader = TraceReader::open(&path).unwrap();
        let applied = replay_trace(&state, &mut reader, 4).unwrap();
        assert_eq!(applied, 4);
        assert_eq!(state.value_base(0, 1), Some(4), "seq 4 wrote key 1");
        assert_eq!(state.value_base(0, 2), Some(2), "seq 5 (key 2) not applied");
        assert_eq!(state.value_base(0, 0), Some(3));
        assert_eq!(state.seqno(), 4);
    }

    #[test]
    fn codec__value_base_round_trips_through_bytes() {
        for (key, base) in [(0u64, 0u32), (42, 7), (u64::MAX, 0x7fff)] {
            let bytes = value_bytes(key, base);
            assert_eq!(parse_value_base(&bytes), Some(base), "key {key} base {base}");
        }
        assert_eq!(parse_value_base(b"garbage"), None);
        assert!(key_bytes(1, 5) < key_bytes(1, 50), "keys order numerically");
    }
}
