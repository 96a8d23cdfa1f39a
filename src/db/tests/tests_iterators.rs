//! Iterator semantics: ordering, snapshot isolation, tombstone
//! filtering, value ownership, and close interaction.

#[cfg(test)]
mod tests {
    use crate::db::tests::helpers::*;
    use crate::db::ReadOptions;
    use std::time::Duration;

    #[test]
    fn iterator_yields_live_keys_in_order() {
        let (_dir, db) = fresh_db();
        db.put(b"c", b"3", &unsynced()).unwrap();
        db.put(b"a", b"1", &unsynced()).unwrap();
        db.put(b"b", b"2", &unsynced()).unwrap();
        db.delete(b"b", &unsynced()).unwrap();

        let mut iter = db.new_iterator(&ReadOptions::default()).unwrap();
        let entries: Vec<_> = iter.by_ref().collect();
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
        iter.close();
        db.close().unwrap();
    }

    #[test]
    fn iterator_merges_memtable_and_tables() {
        let (_dir, db) = fresh_db();
        fill(&db, "disk", 10, &unsynced());
        db.flush().unwrap();
        fill(&db, "mem", 10, &unsynced());

        let iter = db.new_iterator(&ReadOptions::default()).unwrap();
        let keys: Vec<_> = iter.map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 20);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "merged output must stay ordered");
        db.close().unwrap();
    }

    #[test]
    fn iterator_ignores_writes_after_creation() {
        let (_dir, db) = fresh_db();
        db.put(b"k1", b"v1", &unsynced()).unwrap();

        let iter = db.new_iterator(&ReadOptions::default()).unwrap();
        db.put(b"k2", b"v2", &unsynced()).unwrap();
        db.put(b"k1", b"changed", &unsynced()).unwrap();

        let entries: Vec<_> = iter.collect();
        assert_eq!(entries, vec![(b"k1".to_vec(), b"v1".to_vec())]);

        // A new iterator sees the new state.
        let entries: Vec<_> = db.new_iterator(&ReadOptions::default()).unwrap().collect();
        assert_eq!(
            entries,
            vec![
                (b"k1".to_vec(), b"changed".to_vec()),
                (b"k2".to_vec(), b"v2".to_vec()),
            ]
        );
        db.close().unwrap();
    }

    #[test]
    fn iterator_survives_concurrent_flush_and_compaction() {
        let (_dir, db) = fresh_db();
        fill(&db, "key", 50, &unsynced());
        db.flush().unwrap();

        let iter = db.new_iterator(&ReadOptions::default()).unwrap();
        // Rewrite everything and compact under the iterator.
        fill(&db, "key", 50, &unsynced());
        db.flush().unwrap();
        db.compact_range(None, None).unwrap();

        let entries: Vec<_> = iter.collect();
        assert_eq!(entries.len(), 50, "iterator lost rows to a concurrent compaction");
        db.close().unwrap();
    }

    #[test]
    fn range_tombstone_filters_iterator_output() {
        let (_dir, db) = fresh_db();
        fill(&db, "key", 30, &unsynced());
        db.delete_range(b"key-0010", b"key-0020", &unsynced()).unwrap();

        let keys: Vec<_> = db
            .new_iterator(&ReadOptions::default())
            .unwrap()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(keys.len(), 20);
        assert!(keys.contains(&"key-0009".to_string()));
        assert!(!keys.contains(&"key-0010".to_string()));
        assert!(!keys.contains(&"key-0019".to_string()));
        assert!(keys.contains(&"key-0020".to_string()));
        db.close().unwrap();
    }

    #[test]
    fn returned_values_are_owned_by_the_caller() {
        let (_dir, db) = fresh_db();
        db.put(b"k", b"original", &unsynced()).unwrap();

        // Mutating what get/iterator returned must not affect later
        // reads of the same key.
        let mut first = db.get(b"k").unwrap().unwrap();
        first[0] = b'X';
        first.clear();
        assert_eq!(db.get(b"k").unwrap(), Some(b"original".to_vec()));

        let mut from_iter: Vec<_> = db.new_iterator(&ReadOptions::default()).unwrap().collect();
        from_iter[0].1.fill(b'?');
        assert_eq!(db.get(b"k").unwrap(), Some(b"original".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn double_closed_iterator_is_harmless() {
        let (_dir, db) = fresh_db();
        db.put(b"k", b"v", &unsynced()).unwrap();
        let mut iter = db.new_iterator(&ReadOptions::default()).unwrap();
        iter.close();
        iter.close();
        assert_eq!(iter.next(), None, "closed iterator yields nothing");
        db.close().unwrap();
        db.close().unwrap();
    }

    #[test]
    fn close_waits_for_outstanding_iterators() {
        let (_dir, db) = fresh_db();
        db.put(b"k", b"v", &unsynced()).unwrap();
        let iter = db.new_iterator(&ReadOptions::default()).unwrap();

        let closer = {
            let db = db.clone();
            std::thread::spawn(move || db.close())
        };
        // Close must not finish while the iterator lives.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!closer.is_finished(), "close returned with an iterator open");

        drop(iter);
        closer.join().unwrap().unwrap();
    }
}
