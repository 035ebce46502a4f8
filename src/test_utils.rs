//! Shared test helpers: an in-memory repository backend and history builders.
//! Used by the history cache, registry and index test modules.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::SyncError;
use crate::history::{Annotation, History, HistoryEntry, TagList};
use crate::vcs::{repo_relative, DetectFn, Repository, RepositoryDescriptor};

/// Backend double driven entirely by in-memory commits.
#[derive(Debug)]
pub(crate) struct FakeRepo {
    descriptor: RepositoryDescriptor,
    /// Most recent first.
    entries: Mutex<Vec<HistoryEntry>>,
    tags: Option<TagList>,
    dir_history: bool,
    sub_repos: bool,
    updatable: bool,
    pub fail_history: AtomicBool,
    pub fail_since: AtomicBool,
    pub since_times_out: AtomicBool,
    pub history_calls: AtomicUsize,
    pub since_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
}

impl FakeRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            descriptor: RepositoryDescriptor::bare(root, "fake"),
            entries: Mutex::new(Vec::new()),
            tags: None,
            dir_history: true,
            sub_repos: false,
            updatable: false,
            fail_history: AtomicBool::new(false),
            fail_since: AtomicBool::new(false),
            since_times_out: AtomicBool::new(false),
            history_calls: AtomicUsize::new(0),
            since_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.descriptor.kind = kind.to_string();
        self
    }

    pub fn with_entries(self, entries: Vec<HistoryEntry>) -> Self {
        *self.entries.lock().unwrap() = entries;
        self
    }

    pub fn with_tags(mut self, tags: TagList) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_sub_repos(mut self) -> Self {
        self.sub_repos = true;
        self
    }

    pub fn file_history_only(mut self) -> Self {
        self.dir_history = false;
        self
    }

    pub fn updatable(mut self) -> Self {
        self.updatable = true;
        self
    }

    pub fn not_working(mut self) -> Self {
        self.descriptor.is_working = false;
        self
    }

    pub fn remote(mut self) -> Self {
        self.descriptor.is_remote = true;
        self
    }

    /// Record a new commit on top of the existing ones.
    pub fn commit(&self, entry: HistoryEntry) {
        self.entries.lock().unwrap().insert(0, entry);
    }

    pub fn failing(self) -> Self {
        self.fail_history.store(true, Ordering::SeqCst);
        self
    }
}

impl Repository for FakeRepo {
    fn descriptor(&self) -> &RepositoryDescriptor {
        &self.descriptor
    }

    fn history(&self, path: &Path) -> Result<History, SyncError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(SyncError::CommandFailed {
                command: "fake log".to_string(),
                status: "exit status: 128".to_string(),
                stderr: "broken repository".to_string(),
            });
        }
        let rel = repo_relative(self.root(), path);
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter_map(|e| {
                if rel.is_empty() {
                    return Some(e.clone());
                }
                let mut e = e.clone();
                e.files.retain(|f| f == &rel || f.starts_with(&format!("{}/", rel)));
                (!e.files.is_empty()).then_some(e)
            })
            .collect())
    }

    fn history_since(&self, path: &Path, since: &str) -> Result<History, SyncError> {
        self.since_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_since.load(Ordering::SeqCst) {
            return Err(SyncError::CacheInconsistency {
                repo: self.root().display().to_string(),
                revision: since.to_string(),
            });
        }
        if self.since_times_out.load(Ordering::SeqCst) {
            return Err(SyncError::CommandTimeout {
                command: format!("fake log {}..", since),
                timeout_secs: 1,
            });
        }
        self.history(path)?.truncate_since(since, self.root())
    }

    fn annotate(&self, path: &Path, _revision: Option<&str>) -> Result<Annotation, SyncError> {
        let history = self.history(path)?;
        let mut annotation = Annotation::new(repo_relative(self.root(), path));
        for entry in history.entries().iter().rev() {
            annotation.add_line(entry.revision.clone(), entry.author.clone(), true);
        }
        Ok(annotation)
    }

    fn update(&self) -> Result<(), SyncError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.updatable {
            Ok(())
        } else {
            Err(SyncError::unsupported(self.kind(), "update"))
        }
    }

    fn has_history_for_directories(&self) -> bool {
        self.dir_history
    }

    fn supports_sub_repositories(&self) -> bool {
        self.sub_repos
    }

    fn has_file_based_tags(&self) -> bool {
        self.tags.is_some()
    }

    fn tag_list(&self) -> Option<TagList> {
        self.tags.clone()
    }
}

/// `HistoryEntry` touching `files`, dated by its position.
pub(crate) fn entry(revision: &str, date: i64, files: &[&str]) -> HistoryEntry {
    HistoryEntry::new(revision, "dev", date, format!("commit {}", revision)).with_files(files.iter().copied())
}

pub(crate) fn revisions(history: &History) -> Vec<String> {
    history.revisions().map(str::to_string).collect()
}

/// Detector that recognizes exactly the given repositories by root.
pub(crate) fn catalog_detector(repos: Vec<Arc<FakeRepo>>) -> Arc<DetectFn> {
    Arc::new(move |dir: &Path, _config: &Config| -> Result<Option<Arc<dyn Repository>>, SyncError> {
        let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        Ok(repos
            .iter()
            .find(|r| r.root() == dir)
            .map(|r| -> Arc<dyn Repository> { r.clone() }))
    })
}
