//! Unit tests for the history data model, tag assignment and date helpers.

use super::*;
use std::path::Path;

fn entry(rev: &str) -> HistoryEntry {
    HistoryEntry::new(rev, "alice", 0, format!("commit {}", rev))
}

fn history(revs: &[&str]) -> History {
    revs.iter().map(|r| entry(r)).collect()
}

fn by_revision(tag: &TagEntry, entry: &HistoryEntry) -> Ordering {
    natural_cmp(&tag.revision, &entry.revision)
}

// ─── Tag assignment ─────────────────────────────────────────────────

#[test]
fn test_assign_tags_inherits_closest_older_tag() {
    let mut h = history(&["r5", "r4", "r3", "r2", "r1"]);
    let tags = TagList::from_entries(
        vec![TagEntry::new("r4", 0, "v2"), TagEntry::new("r2", 0, "v1")],
        TagEntry::cmp,
    );
    assign_tags(&mut h, &tags, by_revision);

    let got: Vec<Option<&str>> = h.entries().iter().map(|e| e.tags.as_deref()).collect();
    assert_eq!(got, vec![Some("v2"), Some("v2"), Some("v1"), Some("v1"), None]);
}

#[test]
fn test_assign_tags_empty_tag_list_clears() {
    let mut h = history(&["3", "2", "1"]);
    h.entries_mut()[0].tags = Some("stale".to_string());
    assign_tags(&mut h, &TagList::default(), by_revision);
    assert!(h.entries().iter().all(|e| e.tags.is_none()));
}

#[test]
fn test_assign_tags_all_tags_newer_than_history() {
    let mut h = history(&["3", "2", "1"]);
    let tags = TagList::from_entries(vec![TagEntry::new("10", 0, "future")], TagEntry::cmp);
    assign_tags(&mut h, &tags, by_revision);
    assert!(h.entries().iter().all(|e| e.tags.is_none()));
}

#[test]
fn test_assign_tags_by_date_order() {
    let mut h: History = vec![
        HistoryEntry::new("c3", "a", 300, "m"),
        HistoryEntry::new("c2", "a", 200, "m"),
        HistoryEntry::new("c1", "a", 100, "m"),
    ]
    .into_iter()
    .collect();
    let tags = TagList::from_entries(
        vec![TagEntry::new("c2", 200, "release")],
        |a: &TagEntry, b: &TagEntry| a.date.cmp(&b.date),
    );
    assign_tags(&mut h, &tags, |t, e| t.date.cmp(&e.date));
    assert_eq!(h.entries()[0].tags.as_deref(), Some("release"));
    assert_eq!(h.entries()[1].tags.as_deref(), Some("release"));
    assert_eq!(h.entries()[2].tags, None);
}

#[test]
fn test_tag_list_merges_same_revision() {
    let tags = TagList::from_entries(
        vec![
            TagEntry::new("7", 0, "b"),
            TagEntry::new("3", 0, "a"),
            TagEntry::new("7", 0, "c"),
        ],
        TagEntry::cmp,
    );
    assert_eq!(tags.len(), 2);
    assert_eq!(tags.entries()[0].revision, "3");
    assert_eq!(tags.entries()[1].tags, "b, c");
}

#[test]
fn test_tag_entry_order_revision_then_date() {
    let a = TagEntry::new("r9", 5, "x");
    let b = TagEntry::new("r10", 1, "y");
    let c = TagEntry::new("r10", 2, "z");
    assert!(a < b);
    assert!(b < c);
}

// ─── Boundary verification ──────────────────────────────────────────

#[test]
fn test_truncate_since_keeps_strictly_newer() {
    let h = history(&["r12", "r11", "r10", "r9"]);
    let newer = h.truncate_since("r10", Path::new("/src/p")).unwrap();
    assert_eq!(newer.revisions().collect::<Vec<_>>(), vec!["r12", "r11"]);
}

#[test]
fn test_truncate_since_missing_revision_is_inconsistency() {
    let h = history(&["r12", "r11"]);
    let err = h.truncate_since("r10", Path::new("/src/p")).unwrap_err();
    assert!(matches!(err, SyncError::CacheInconsistency { ref revision, .. } if revision == "r10"));
}

#[test]
fn test_truncate_since_latest_yields_empty() {
    let h = history(&["r3", "r2"]);
    let newer = h.truncate_since("r3", Path::new("/src/p")).unwrap();
    assert!(newer.is_empty());
}

#[test]
fn test_remove_and_verify_oldest_mismatch() {
    let mut h = history(&["r12", "r11"]);
    let err = h.remove_and_verify_oldest("r10", Path::new("/src/p")).unwrap_err();
    assert!(matches!(err, SyncError::CacheInconsistency { .. }));
}

#[test]
fn test_remove_and_verify_oldest_empty() {
    let mut h = History::default();
    assert!(h.remove_and_verify_oldest("r1", Path::new("/src/p")).is_err());
}

// ─── Annotation ─────────────────────────────────────────────────────

#[test]
fn test_annotation_cross_reference() {
    let mut ann = Annotation::new("main.c");
    ann.add_line("r3", "bob", true);
    ann.add_line("r1", "alice", true);
    ann.add_line("r3", "bob", true);

    let h = history(&["r3", "r2", "r1"]);
    ann.cross_reference(&h);

    assert_eq!(ann.revisions().len(), 2);
    assert_eq!(ann.file_version("r3"), Some(3));
    assert_eq!(ann.file_version("r1"), Some(1));
    assert_eq!(ann.file_version("r2"), None);
    assert!(ann.description("r3").unwrap().contains("commit r3"));
    assert_eq!(ann.revision_at(2), Some("r1"));
    assert_eq!(ann.author_at(1), Some("bob"));
    assert_eq!(ann.revision_at(0), None);
}

#[test]
fn test_history_entry_add_file_dedups() {
    let mut e = entry("1");
    e.add_file("a.c");
    e.add_file("a.c");
    e.add_file("b.c");
    assert_eq!(e.files, vec!["a.c", "b.c"]);
}

// ─── natural_cmp ────────────────────────────────────────────────────

#[test]
fn test_natural_cmp_numeric_runs() {
    assert_eq!(natural_cmp("r9", "r10"), Ordering::Less);
    assert_eq!(natural_cmp("12:abc", "2:abc"), Ordering::Greater);
    assert_eq!(natural_cmp("007", "7"), Ordering::Equal);
    assert_eq!(natural_cmp("abc", "abd"), Ordering::Less);
    assert_eq!(natural_cmp("v1.10", "v1.9"), Ordering::Greater);
    assert_eq!(natural_cmp("", "a"), Ordering::Less);
}

// ─── Date helpers ───────────────────────────────────────────────────

#[test]
fn test_format_timestamp() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    assert_eq!(format_timestamp(1700000000), "2023-11-14 22:13:20");
}

#[test]
fn test_parse_datetime_with_offset() {
    assert_eq!(parse_datetime("2023-11-14 22:13:20 +0000"), Some(1700000000));
    assert_eq!(parse_datetime("2023-11-15 01:13:20 +0300"), Some(1700000000));
    assert_eq!(parse_datetime("2023-11-14 17:13:20 -0500"), Some(1700000000));
}

#[test]
fn test_parse_datetime_invalid() {
    assert_eq!(parse_datetime("yesterday"), None);
    assert_eq!(parse_datetime("2023-13-01 00:00:00"), None);
}

#[test]
fn test_parse_tz_offset() {
    assert_eq!(parse_tz_offset("+0545"), 5 * 3600 + 45 * 60);
    assert_eq!(parse_tz_offset("-0100"), -3600);
    assert_eq!(parse_tz_offset(""), 0);
}

// ─── Properties ─────────────────────────────────────────────────────

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The linear merge agrees with a brute-force "closest tag <= entry" search.
        #[test]
        fn assign_tags_matches_brute_force(
            revs in proptest::collection::btree_set(1u32..500, 1..40),
            tag_revs in proptest::collection::btree_set(1u32..500, 0..10)
        ) {
            let revs_desc: Vec<u32> = revs.iter().rev().copied().collect();
            let mut h: History = revs_desc.iter().map(|r| entry(&r.to_string())).collect();
            let tags = TagList::from_entries(
                tag_revs.iter().map(|r| TagEntry::new(r.to_string(), 0, format!("t{}", r))).collect(),
                TagEntry::cmp,
            );
            assign_tags(&mut h, &tags, by_revision);

            for (e, rev) in h.entries().iter().zip(&revs_desc) {
                let expected = tag_revs.iter().filter(|t| *t <= rev).max().map(|t| format!("t{}", t));
                prop_assert_eq!(e.tags.clone(), expected);
            }
        }

        /// Formatting and parsing agree for any timestamp in a sane range.
        #[test]
        fn timestamp_roundtrip(ts in 0i64..4_000_000_000) {
            prop_assert_eq!(parse_datetime(&format_timestamp(ts)), Some(ts));
        }
    }
}
