//! Version-edit coding: round trips, tagged-field independence, and
//! decode-side rejection of malformed payloads.

#[cfg(test)]
mod tests {
    use crate::keys::{InternalKey, ValueKind};
    use crate::manifest::tests::helpers::file_meta;
    use crate::manifest::{ManifestError, VersionEdit};

    #[test]
    fn empty_edit_round_trips() {
        let edit = VersionEdit::default();
        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn full_edit_round_trips() {
        let edit = VersionEdit {
            comparator_name: Some("rockyardkv.BytewiseComparator".into()),
            log_number: Some(12),
            prev_log_number: Some(3),
            next_file_number: Some(99),
            last_sequence: Some(123_456_789),
            compact_pointers: vec![(2, InternalKey::new(b"cursor", 9, ValueKind::Value))],
            deleted_files: vec![(0, 4), (1, 8)],
            new_files: vec![
                file_meta(15, 0, b"aaa", b"mmm", 100),
                file_meta(16, 1, b"nnn", b"zzz", 90),
            ],
        };
        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn absent_fields_stay_absent() {
        let edit = VersionEdit {
            last_sequence: Some(5),
            ..VersionEdit::default()
        };
        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded.last_sequence, Some(5));
        assert_eq!(decoded.log_number, None);
        assert_eq!(decoded.next_file_number, None);
        assert!(decoded.new_files.is_empty());
    }

    #[test]
    fn new_file_preserves_key_range_and_seqnos() {
        let file = file_meta(7, 3, b"begin", b"end", 77);
        let edit = VersionEdit {
            new_files: vec![file.clone()],
            ..VersionEdit::default()
        };
        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        let out = &decoded.new_files[0];
        assert_eq!(out.file_number, 7);
        assert_eq!(out.level, 3);
        assert_eq!(out.smallest.user_key(), b"begin");
        assert_eq!(out.largest.user_key(), b"end");
        assert_eq!(out.smallest_seqno, file.smallest_seqno);
        assert_eq!(out.largest_seqno, 77);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut payload = Vec::new();
        crate::encoding::put_varint32(&mut payload, 200);
        match VersionEdit::decode(&payload) {
            Err(ManifestError::Corruption(reason)) => {
                assert!(reason.contains("tag"), "reason: {reason}")
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let edit = VersionEdit {
            new_files: vec![file_meta(15, 0, b"aaa", b"mmm", 100)],
            ..VersionEdit::default()
        };
        let bytes = edit.encode();
        for cut in 1..bytes.len() {
            assert!(
                VersionEdit::decode(&bytes[..cut]).is_err(),
                "cut at {cut} silently decoded"
            );
        }
    }
}
