//! End-to-end oracle verification: a randomized workload recorded in a
//! trace, a crash, and a replay of the trace up to the recovered
//! sequence number must reproduce the database's exact state.

#[cfg(test)]
mod tests {
    use crate::db::tests::helpers::*;
    use crate::db::Database;
    use crate::oracle::{
        ExpectedState, TraceHeader, TraceOp, TraceReader, TraceRecord, TraceWriter, key_bytes,
        parse_value_base, replay_trace, value_bytes,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    const NUM_KEYS: u64 = 64;
    const NUM_OPS: usize = 300;

    /// Compare every oracle slot against the database.
    fn verify_against_oracle(db: &Database, oracle: &ExpectedState) {
        for key in 0..NUM_KEYS {
            let db_value = db.get(&key_bytes(0, key)).expect("get");
            match (oracle.exists(0, key), db_value) {
                (true, Some(value)) => {
                    let base = parse_value_base(&value)
                        .unwrap_or_else(|| panic!("unparseable value for key {key}"));
                    assert_eq!(
                        Some(base),
                        oracle.value_base(0, key),
                        "key {key}: value generation mismatch"
                    );
                }
                (false, None) => {}
                (true, None) => panic!("key {key}: oracle says present, database says absent"),
                (false, Some(_)) => panic!("key {key}: oracle says absent, database has it"),
            }
        }
    }

    #[test]
    fn trace_replay_matches_database_after_crash() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        let state_path = dir.path().join("expected_state.bin");
        let trace_path = dir.path().join("run.trace");

        let mut bases = vec![0u32; NUM_KEYS as usize];
        {
            let db = Database::open(dir.path().join("db"), fault_options(&fault)).unwrap();

            // Snapshot the (empty) oracle at the session's start.
            let oracle = ExpectedState::new(1, NUM_KEYS);
            oracle.set_seqno(db.latest_sequence());
            oracle.save(&state_path).unwrap();

            let mut trace = TraceWriter::create(
                &trace_path,
                TraceHeader {
                    start_seq: db.latest_sequence(),
                    num_cfs: 1,
                    max_key: NUM_KEYS,
                },
            )
            .unwrap();

            let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
            for op_index in 0..NUM_OPS {
                let key = rng.random_range(0..NUM_KEYS);
                let sync = op_index % 7 == 0;
                let opts = if sync { synced() } else { unsynced() };

                if rng.random_range(0..4) == 0 {
                    let pending = oracle.begin_delete(0, key);
                    db.delete(&key_bytes(0, key), &opts).unwrap();
                    trace
                        .append(TraceRecord {
                            op: TraceOp::Delete,
                            cf: 0,
                            key,
                            value_base: 0,
                            seqno: db.latest_sequence(),
                        })
                        .unwrap();
                    pending.commit();
                } else {
                    bases[key as usize] += 1;
                    let base = bases[key as usize];
                    let pending = oracle.begin_put(0, key, base);
                    db.put(&key_bytes(0, key), &value_bytes(key, base), &opts)
                        .unwrap();
                    trace
                        .append(TraceRecord {
                            op: TraceOp::Put,
                            cf: 0,
                            key,
                            value_base: base,
                            seqno: db.latest_sequence(),
                        })
                        .unwrap();
                    pending.commit();
                }
                // Occasionally push data to tables mid-run.
                if op_index == NUM_OPS / 2 {
                    db.flush().unwrap();
                }
            }
            trace.sync().unwrap();
            drop(db); // crash
        }
        fault.drop_unsynced_data().unwrap();
        fault.revert_unsynced_renames().unwrap();
        fault.delete_unsynced_files().unwrap();

        // Recover, then replay the trace up to the recovered sequence.
        let db = reopen(&dir.path().join("db"));
        let recovered_seq = db.latest_sequence();

        let oracle = ExpectedState::load(&state_path).unwrap();
        let mut reader = TraceReader::open(&trace_path).unwrap();
        replay_trace(&oracle, &mut reader, recovered_seq).unwrap();

        verify_against_oracle(&db, &oracle);
        db.close().unwrap();
    }

    #[test]
    fn flush_barrier_guarantees_oracle_state_survives() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        let oracle = ExpectedState::new(1, NUM_KEYS);
        {
            let db = Database::open(dir.path().join("db"), fault_options(&fault)).unwrap();
            let mut rng = StdRng::seed_from_u64(7);
            for _ in 0..150 {
                let key = rng.random_range(0..NUM_KEYS);
                let base = rng.random_range(1..0x7fffu32);
                let pending = oracle.begin_put(0, key, base);
                db.put(&key_bytes(0, key), &value_bytes(key, base), &unsynced())
                    .unwrap();
                pending.commit();
            }
            // Flush barrier: everything before this point is durable.
            db.flush().unwrap();
            oracle.set_seqno(db.latest_sequence());

            // Later unsynced writes may or may not survive; the oracle
            // below only asserts the barrier state.
            db.put(&key_bytes(0, 0), &value_bytes(0, 0x7ffe), &wal_disabled())
                .unwrap();
            drop(db); // crash
        }
        fault.drop_unsynced_data().unwrap();
        fault.revert_unsynced_renames().unwrap();
        fault.delete_unsynced_files().unwrap();

        let db = reopen(&dir.path().join("db"));
        for key in 0..NUM_KEYS {
            if let Some(expected_base) = oracle.value_base(0, key) {
                let value = db
                    .get(&key_bytes(0, key))
                    .unwrap()
                    .unwrap_or_else(|| panic!("key {key} lost after flush barrier"));
                let base = parse_value_base(&value).expect("parseable value");
                assert!(
                    base >= expected_base,
                    "key {key} regressed below the flush barrier ({base} < {expected_base})"
                );
            }
        }
        db.close().unwrap();
    }
}
