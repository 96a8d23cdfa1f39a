//! Power-loss crash tests over the fault-injection filesystem.
//!
//! `drop_unsynced_data` + `revert_unsynced_renames` +
//! `delete_unsynced_files` simulate the storage device after a power
//! cut: only fsync'd bytes, dir-synced renames, and fsync'd files
//! survive. Each test then reopens through the *real* filesystem and
//! checks the durability contract.

#[cfg(test)]
mod tests {
    use crate::db::tests::helpers::*;
    use crate::db::Database;
    use crate::vfs::fault::FaultFs;
    use tempfile::TempDir;

    /// Simulate power loss on everything not durably on the medium.
    fn power_loss(fault: &FaultFs) {
        fault.drop_unsynced_data().expect("drop unsynced");
        fault.revert_unsynced_renames().expect("revert renames");
        fault.delete_unsynced_files().expect("delete unsynced");
    }

    #[test]
    fn synced_put_survives_power_loss() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            db.put(b"k", b"v", &synced()).unwrap();
            drop(db); // crash
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()), "acknowledged sync write lost in crash");
        db.close().unwrap();
    }

    #[test]
    fn every_acknowledged_synced_write_survives() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            fill(&db, "key", 50, &synced());
            drop(db);
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        verify_fill(&db, "key", 50);
        db.close().unwrap();
    }

    #[test]
    fn flushed_put_survives_unsynced_data_drop() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            // Unsynced write, then Flush: the flush alone promises
            // durability.
            db.put(b"k", b"v", &unsynced()).unwrap();
            db.flush().unwrap();
            drop(db);
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()), "flushed write lost in crash");
        db.close().unwrap();
    }

    #[test]
    fn wal_disabled_write_is_lost_but_flushed_value_survives() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            db.put(b"k", b"V1", &synced()).unwrap();
            db.flush().unwrap();
            db.put(b"k", b"V2", &wal_disabled()).unwrap();
            assert_eq!(db.get(b"k").unwrap(), Some(b"V2".to_vec()), "visible before crash");
            drop(db);
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        assert_eq!(
            db.get(b"k").unwrap(),
            Some(b"V1".to_vec()),
            "flushed V1 must reappear; WAL-less V2 must be gone"
        );
        db.close().unwrap();
    }

    #[test]
    fn unsynced_writes_may_vanish_but_synced_prefix_stays() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            fill(&db, "durable", 20, &synced());
            fill(&db, "volatile", 20, &unsynced());
            drop(db);
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        verify_fill(&db, "durable", 20);
        // The volatile suffix is allowed to be gone (it was never
        // acknowledged durable); what is not allowed is corruption.
        for i in 0..20 {
            let key = format!("volatile-{i:04}");
            let got = db.get(key.as_bytes()).unwrap();
            assert!(
                got.is_none() || got == Some(format!("val-{i:04}").into_bytes()),
                "{key} corrupted: {got:?}"
            );
        }
        db.close().unwrap();
    }

    #[test]
    fn batch_is_atomic_across_power_loss() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            let mut batch = crate::batch::WriteBatch::new();
            for i in 0..50 {
                batch.put(format!("batch-{i:02}").as_bytes(), b"v");
            }
            db.write(batch, &synced()).unwrap();
            drop(db);
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        let present = (0..50)
            .filter(|i| {
                db.get(format!("batch-{i:02}").as_bytes())
                    .unwrap()
                    .is_some()
            })
            .count();
        assert!(
            present == 0 || present == 50,
            "partial batch after crash ({present}/50 present)"
        );
        assert_eq!(present, 50, "the batch was acknowledged with sync=true");
        db.close().unwrap();
    }

    #[test]
    fn torn_unsynced_batch_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            // Anchor so the WAL has a synced prefix.
            db.put(b"anchor", b"x", &synced()).unwrap();
            let mut batch = crate::batch::WriteBatch::new();
            for i in 0..50 {
                batch.put(format!("torn-{i:02}").as_bytes(), b"v");
            }
            // Unsynced: the crash may tear it out of the WAL tail.
            db.write(batch, &unsynced()).unwrap();
            drop(db);
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        assert_eq!(db.get(b"anchor").unwrap(), Some(b"x".to_vec()));
        let present = (0..50)
            .filter(|i| {
                db.get(format!("torn-{i:02}").as_bytes())
                    .unwrap()
                    .is_some()
            })
            .count();
        assert!(
            present == 0 || present == 50,
            "torn batch partially applied ({present}/50)"
        );
        db.close().unwrap();
    }

    #[test]
    fn sequences_never_reuse_across_crash_cycles() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        let mut high_water = 0u64;
        for round in 0..4 {
            let db = reopen_with(dir.path(), fault_options(&fault));
            assert!(
                db.latest_sequence() >= high_water,
                "round {round}: recovered {} below durable high-water {high_water}",
                db.latest_sequence()
            );
            fill(&db, &format!("r{round}"), 10, &synced());
            high_water = db.latest_sequence();
            db.flush().unwrap();
            drop(db);
            power_loss(&fault);
        }

        // After recovery, fresh sequences strictly exceed the
        // largest sequence stored in any live table.
        let db = reopen(dir.path());
        let max_table_seqno = {
            let versions = crate::db::lock_or_recover(&db.inner.versions);
            let version = versions.current();
            version.max_file_seqno()
        };
        db.put(b"probe", b"x", &synced()).unwrap();
        assert!(
            db.latest_sequence() > max_table_seqno,
            "new sequence {} does not exceed live-table max {max_table_seqno}",
            db.latest_sequence()
        );
        db.close().unwrap();
    }

    #[test]
    fn crash_between_flush_and_next_write_keeps_both_epochs() {
        let dir = TempDir::new().unwrap();
        let fault = fault_fs();
        {
            let db = Database::open(dir.path(), fault_options(&fault)).unwrap();
            fill(&db, "old", 20, &synced());
            db.flush().unwrap();
            fill(&db, "new", 20, &synced());
            drop(db);
        }
        power_loss(&fault);

        let db = reopen(dir.path());
        verify_fill(&db, "old", 20);
        verify_fill(&db, "new", 20);
        db.close().unwrap();
    }
}
