//! Range-tombstone resolution: coverage, sequence precedence, snapshots.

#[cfg(test)]
mod tests {
    use crate::keys::ValueKind;
    use crate::memtable::{Memtable, MemtableGet};

    #[test]
    fn range_tombstone_masks_older_points_in_range() {
        let mem = Memtable::new();
        mem.add(1, ValueKind::Value, b"a", b"va");
        mem.add(2, ValueKind::Value, b"m", b"vm");
        mem.add(3, ValueKind::Value, b"z", b"vz");
        mem.add_range_tombstone(b"a", b"n", 5);

        assert_eq!(mem.get(b"a", 10), MemtableGet::Deleted, "start is inclusive");
        assert_eq!(mem.get(b"m", 10), MemtableGet::Deleted);
        assert_eq!(mem.get(b"n", 10), MemtableGet::NotFound, "end is exclusive");
        assert_eq!(mem.get(b"z", 10), MemtableGet::Value(b"vz".to_vec()));
    }

    #[test]
    fn newer_point_write_survives_older_tombstone() {
        let mem = Memtable::new();
        mem.add_range_tombstone(b"a", b"z", 5);
        mem.add(7, ValueKind::Value, b"k", b"fresh");

        assert_eq!(mem.get(b"k", 10), MemtableGet::Value(b"fresh".to_vec()));
        assert_eq!(mem.get(b"k", 6), MemtableGet::Deleted, "older snapshot sees tombstone");
    }

    #[test]
    fn tombstone_invisible_before_its_sequence() {
        let mem = Memtable::new();
        mem.add(2, ValueKind::Value, b"k", b"v");
        mem.add_range_tombstone(b"a", b"z", 8);

        assert_eq!(mem.get(b"k", 7), MemtableGet::Value(b"v".to_vec()));
        assert_eq!(mem.get(b"k", 8), MemtableGet::Deleted);
    }

    #[test]
    fn covered_key_with_no_point_entry_reads_deleted() {
        let mem = Memtable::new();
        mem.add_range_tombstone(b"a", b"z", 3);
        assert_eq!(mem.get(b"m", 10), MemtableGet::Deleted);
        assert_eq!(mem.get(b"zz", 10), MemtableGet::NotFound);
    }

    #[test]
    fn overlapping_tombstones_use_highest_sequence() {
        let mem = Memtable::new();
        mem.add(4, ValueKind::Value, b"k", b"v4");
        mem.add_range_tombstone(b"a", b"z", 2);
        mem.add_range_tombstone(b"j", b"m", 6);

        // The newer tombstone wins over the point at 4.
        assert_eq!(mem.get(b"k", 10), MemtableGet::Deleted);
        // Outside the newer tombstone only the older (seq 2) applies.
        mem.add(3, ValueKind::Value, b"b", b"v3");
        assert_eq!(mem.get(b"b", 10), MemtableGet::Value(b"v3".to_vec()));
    }

    #[test]
    fn range_tombstones_snapshot_is_sorted() {
        let mem = Memtable::new();
        mem.add_range_tombstone(b"m", b"p", 3);
        mem.add_range_tombstone(b"a", b"c", 5);
        mem.add_range_tombstone(b"a", b"d", 9);

        let tombstones = mem.range_tombstones();
        let summary: Vec<_> = tombstones
            .iter()
            .map(|t| (t.start.clone(), t.sequence))
            .collect();
        assert_eq!(
            summary,
            vec![(b"a".to_vec(), 9), (b"a".to_vec(), 5), (b"m".to_vec(), 3)],
            "start ascending, sequence descending"
        );
    }

    #[test]
    fn add_routes_range_deletion_kind_to_tombstones() {
        let mem = Memtable::new();
        mem.add(5, ValueKind::RangeDeletion, b"a", b"z");
        assert_eq!(mem.get(b"m", 10), MemtableGet::Deleted);
        assert_eq!(mem.range_tombstones().len(), 1);
        // Range deletions do not appear as point entries.
        assert_eq!(mem.iter().count(), 0);
    }
}
