//! Unit tests for the file-backed history cache.
//!
//! All tests use the in-memory backend; no VCS binary required.

use super::*;
use crate::test_utils::{entry, revisions, FakeRepo};

// ─── Test helpers ───────────────────────────────────────────────────

fn three_commits() -> Vec<HistoryEntry> {
    vec![
        entry("c3", 300, &["src/main.rs"]),
        entry("c2", 200, &["src/main.rs", "src/lib.rs"]),
        entry("c1", 100, &["src/main.rs", "Cargo.toml"]),
    ]
}

fn setup() -> (tempfile::TempDir, FileHistoryCache, FakeRepo) {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileHistoryCache::new(dir.path().join("historycache"));
    let repo = FakeRepo::new("/src/proj").with_entries(three_commits());
    (dir, cache, repo)
}

fn root() -> &'static Path {
    Path::new("/src/proj")
}

// ─── Store / get ────────────────────────────────────────────────────

#[test]
fn test_get_uncached_repository_is_none() {
    let (_tmp, cache, repo) = setup();
    assert!(cache.get(root(), &repo, true).unwrap().is_none());
    assert!(cache.latest_cached_revision(&repo).is_none());
    assert!(!cache.has_cache_for_directory(root(), &repo));
}

#[test]
fn test_store_then_get_whole_repository() {
    let (_tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();

    let h = cache.get(root(), &repo, true).unwrap().unwrap();
    assert_eq!(revisions(&h), vec!["c3", "c2", "c1"]);
    assert_eq!(cache.latest_cached_revision(&repo).as_deref(), Some("c3"));
    assert!(cache.has_cache_for_directory(&root().join("src"), &repo));
    assert!(!cache.has_cache_for_directory(Path::new("/elsewhere"), &repo));
}

#[test]
fn test_get_single_file() {
    let (_tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();

    let h = cache.get(&root().join("src/lib.rs"), &repo, true).unwrap().unwrap();
    assert_eq!(revisions(&h), vec!["c2"]);
    assert_eq!(h.entries()[0].files, vec!["src/lib.rs"]);

    assert!(cache.get(&root().join("missing.rs"), &repo, true).unwrap().is_none());
}

#[test]
fn test_get_directory_aggregates_without_sibling_prefix() {
    let (_tmp, cache, repo) = setup();
    let mut entries = three_commits();
    entries.insert(0, entry("c4", 400, &["src2/other.rs"]));
    cache.store(&History::new(entries), &repo).unwrap();

    let h = cache.get(&root().join("src"), &repo, true).unwrap().unwrap();
    assert_eq!(revisions(&h), vec!["c3", "c2", "c1"]);
    assert!(h.entries().iter().all(|e| e.files.iter().all(|f| f.starts_with("src/"))));
}

#[test]
fn test_get_without_files_strips_lists() {
    let (_tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    let h = cache.get(root(), &repo, false).unwrap().unwrap();
    assert!(h.entries().iter().all(|e| e.files.is_empty()));
}

#[test]
fn test_overlapping_stores_do_not_duplicate() {
    let (_tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();

    // a per-file store of an already cached revision only extends its files
    let partial = History::new(vec![entry("c2", 200, &["docs/guide.md"])]);
    cache.store(&partial, &repo).unwrap();

    let h = cache.get(root(), &repo, true).unwrap().unwrap();
    assert_eq!(revisions(&h), vec!["c3", "c2", "c1"]);
    assert_eq!(h.entries()[1].files, vec!["docs/guide.md", "src/main.rs", "src/lib.rs"]);
    assert_eq!(
        revisions(&cache.get(&root().join("docs"), &repo, true).unwrap().unwrap()),
        vec!["c2"]
    );
}

#[test]
fn test_incremental_store_prepends_newer() {
    let (_tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    cache
        .store(&History::new(vec![entry("c4", 400, &["README"])]), &repo)
        .unwrap();
    assert_eq!(cache.latest_cached_revision(&repo).as_deref(), Some("c4"));
}

#[test]
fn test_store_empty_history_is_noop() {
    let (tmp, cache, repo) = setup();
    cache.store(&History::default(), &repo).unwrap();
    assert!(cache.latest_cached_revision(&repo).is_none());
    assert!(!tmp.path().join("historycache").exists());
}

// ─── Persistence ────────────────────────────────────────────────────

#[test]
fn test_reload_from_disk() {
    let (tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    drop(cache);

    let reopened = FileHistoryCache::new(tmp.path().join("historycache"));
    let h = reopened.get(&root().join("Cargo.toml"), &repo, true).unwrap().unwrap();
    assert_eq!(revisions(&h), vec!["c1"]);
}

#[test]
fn test_corrupt_file_is_discarded() {
    let (tmp, cache, repo) = setup();
    let base = tmp.path().join("historycache");
    std::fs::create_dir_all(&base).unwrap();
    std::fs::write(data_path_for(root(), &base, CACHE_EXT), b"garbage").unwrap();

    assert!(cache.get(root(), &repo, true).unwrap().is_none());
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    assert_eq!(cache.latest_cached_revision(&repo).as_deref(), Some("c3"));
}

// ─── Clearing ───────────────────────────────────────────────────────

#[test]
fn test_clear_removes_memory_and_disk() {
    let (tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    cache.clear(&repo).unwrap();
    assert!(cache.latest_cached_revision(&repo).is_none());

    let reopened = FileHistoryCache::new(tmp.path().join("historycache"));
    assert!(reopened.get(root(), &repo, true).unwrap().is_none());
    // clearing twice is fine
    cache.clear(&repo).unwrap();
}

#[test]
fn test_clear_file() {
    let (_tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    cache.clear_file(&root().join("src/lib.rs")).unwrap();

    assert!(cache.get(&root().join("src/lib.rs"), &repo, true).unwrap().is_none());
    assert!(cache.get(&root().join("src/main.rs"), &repo, true).unwrap().is_some());
    // unknown repository is ignored
    cache.clear_file(Path::new("/nowhere/x.c")).unwrap();
}

// ─── Optimize ───────────────────────────────────────────────────────

#[test]
fn test_compact_merges_duplicate_revisions() {
    let mut data = RepoHistory::default();
    data.commits = vec![
        entry("c2", 200, &["a", "a"]),
        entry("c1", 100, &["b"]),
        entry("c2", 200, &["c"]),
    ];
    assert_eq!(data.compact(), 1);
    assert_eq!(data.commits[0].files, vec!["a", "c"]);
    assert_eq!(data.file_commits["c"], vec![0]);
}

#[test]
fn test_optimize_keeps_content() {
    let (_tmp, cache, repo) = setup();
    cache.store(&repo.history(root()).unwrap(), &repo).unwrap();
    cache.optimize().unwrap();
    let h = cache.get(root(), &repo, true).unwrap().unwrap();
    assert_eq!(h.len(), 3);
    assert!(cache.info().contains("1 repositories loaded, 3 commits"));
    assert_eq!(cache.cached_repositories(), vec![PathBuf::from("/src/proj")]);
}

#[test]
fn test_supports_only_working_repositories() {
    let (_tmp, cache, repo) = setup();
    assert!(cache.supports_repository(&repo));
    assert!(!cache.supports_repository(&FakeRepo::new("/src/x").not_working()));
}

// ─── Path prefix matching ───────────────────────────────────────────

#[test]
fn test_matches_path_prefix() {
    assert!(matches_path_prefix("src/main.rs", "src"));
    assert!(matches_path_prefix("src", "src"));
    assert!(!matches_path_prefix("src2/main.rs", "src"));
    assert!(matches_path_prefix("anything", ""));
}
