//! Persistent history cache.
//!
//! [`FileHistoryCache`] keeps one compressed file per repository under the
//! cache root. In memory each repository is a commit list (most recent
//! first) plus a `file → commit indices` map for per-file lookups.
//! Directory queries aggregate every commit touching a path under the
//! directory (`== dir || starts_with(dir + "/")`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{History, HistoryEntry};
use crate::error::SyncError;
use crate::storage::{data_path_for, load_compressed, save_compressed};
use crate::vcs::{repo_relative, Repository};

/// Cache format version. Bump when struct layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

const CACHE_EXT: &str = "history";

// ─── Contract ───────────────────────────────────────────────────────

/// Pluggable history store used by the registry and the index databases.
pub trait HistoryCache: Send + Sync {
    fn supports_repository(&self, repo: &dyn Repository) -> bool;

    /// Cached history of a file or directory, `None` when nothing is cached.
    fn get(&self, path: &Path, repo: &dyn Repository, with_files: bool) -> Result<Option<History>, SyncError>;

    /// True when a repository-wide snapshot exists for `repo`.
    fn has_cache_for_directory(&self, dir: &Path, repo: &dyn Repository) -> bool;

    fn latest_cached_revision(&self, repo: &dyn Repository) -> Option<String>;

    /// Merge `history` into the stored data. Entries whose revision is
    /// already cached only extend that entry's file list.
    fn store(&self, history: &History, repo: &dyn Repository) -> Result<(), SyncError>;

    fn clear(&self, repo: &dyn Repository) -> Result<(), SyncError>;

    /// Forget the history of one file (absolute path).
    fn clear_file(&self, path: &Path) -> Result<(), SyncError>;

    /// Compact the stored data. Run once after a batch of stores.
    fn optimize(&self) -> Result<(), SyncError>;

    fn info(&self) -> String;
}

// ─── Stored form ────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RepoHistory {
    format_version: u32,
    repo_root: PathBuf,
    kind: String,
    built_at: u64,
    /// Most recent first.
    commits: Vec<HistoryEntry>,
    /// Repository-relative file path → indices into `commits`.
    #[serde(skip)]
    file_commits: HashMap<String, Vec<u32>>,
    #[serde(skip)]
    by_revision: HashMap<String, u32>,
}

impl RepoHistory {
    fn new(repo: &dyn Repository) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            repo_root: repo.root().to_path_buf(),
            kind: repo.kind().to_string(),
            ..Default::default()
        }
    }

    fn reindex(&mut self) {
        self.file_commits.clear();
        self.by_revision.clear();
        for (idx, commit) in self.commits.iter().enumerate() {
            self.by_revision.insert(commit.revision.clone(), idx as u32);
            for file in &commit.files {
                self.file_commits.entry(file.clone()).or_default().push(idx as u32);
            }
        }
    }

    fn latest_revision(&self) -> Option<&str> {
        self.commits.first().map(|c| c.revision.as_str())
    }

    /// Incoming entries take precedence in ordering; cached ones keep their
    /// relative order. The result is stably re-sorted newest first.
    fn merge(&mut self, history: &History) {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut merged: Vec<HistoryEntry> = Vec::with_capacity(self.commits.len() + history.len());

        for incoming in history.entries() {
            if !seen.insert(incoming.revision.as_str()) {
                if let Some(existing) = merged.iter_mut().find(|e| e.revision == incoming.revision) {
                    for f in &incoming.files {
                        existing.add_file(f);
                    }
                }
                continue;
            }
            let mut entry = incoming.clone();
            if let Some(&idx) = self.by_revision.get(&incoming.revision) {
                let cached = &self.commits[idx as usize];
                for f in &cached.files {
                    entry.add_file(f);
                }
                if entry.tags.is_none() {
                    entry.tags = cached.tags.clone();
                }
            }
            merged.push(entry);
        }
        for cached in &self.commits {
            if !seen.contains(cached.revision.as_str()) {
                merged.push(cached.clone());
            }
        }
        merged.sort_by(|a, b| b.date.cmp(&a.date));

        self.commits = merged;
        self.built_at = crate::now_secs();
        self.reindex();
    }

    fn query(&self, rel: &str, with_files: bool) -> Option<History> {
        let indices: Vec<u32> = if rel.is_empty() {
            (0..self.commits.len() as u32).collect()
        } else if let Some(ids) = self.file_commits.get(rel) {
            ids.clone()
        } else {
            let mut ids: Vec<u32> = self
                .file_commits
                .iter()
                .filter(|(file, _)| matches_path_prefix(file, rel))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect();
            if ids.is_empty() {
                return None;
            }
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        let entries = indices
            .into_iter()
            .filter_map(|idx| self.commits.get(idx as usize))
            .map(|c| {
                let mut entry = c.clone();
                if with_files {
                    entry.files.retain(|f| matches_path_prefix(f, rel));
                } else {
                    entry.files.clear();
                }
                entry
            })
            .collect();
        Some(History::new(entries))
    }

    fn forget_file(&mut self, rel: &str) -> bool {
        let mut changed = false;
        for commit in &mut self.commits {
            let before = commit.files.len();
            commit.files.retain(|f| f != rel);
            changed |= commit.files.len() != before;
        }
        if changed {
            self.reindex();
        }
        changed
    }

    /// Dedup revisions and file lists, restore ordering, rebuild the indices.
    fn compact(&mut self) -> usize {
        let before = self.commits.len();
        let mut out: Vec<HistoryEntry> = Vec::with_capacity(before);
        let mut pos: HashMap<String, usize> = HashMap::new();
        for commit in self.commits.drain(..) {
            match pos.get(&commit.revision) {
                Some(&i) => {
                    for f in &commit.files {
                        out[i].add_file(f);
                    }
                }
                None => {
                    pos.insert(commit.revision.clone(), out.len());
                    let mut files: Vec<String> = Vec::with_capacity(commit.files.len());
                    for f in commit.files.iter() {
                        if !files.contains(f) {
                            files.push(f.clone());
                        }
                    }
                    out.push(HistoryEntry { files, ..commit });
                }
            }
        }
        out.sort_by(|a, b| b.date.cmp(&a.date));
        out.shrink_to_fit();
        self.commits = out;
        self.reindex();
        before - self.commits.len()
    }
}

// ─── Path prefix matching ───────────────────────────────────────────

/// `== path || starts_with(path + "/")`, so `src` doesn't match `src2`.
fn matches_path_prefix(file_path: &str, query_path: &str) -> bool {
    if query_path.is_empty() {
        return true;
    }
    file_path == query_path
        || (file_path.len() > query_path.len()
            && file_path.starts_with(query_path)
            && file_path.as_bytes()[query_path.len()] == b'/')
}

// ─── File-backed implementation ─────────────────────────────────────

type Slot = Arc<RwLock<RepoHistory>>;

/// One compressed file per repository under `base`.
pub struct FileHistoryCache {
    base: PathBuf,
    repos: RwLock<HashMap<PathBuf, Slot>>,
}

impl FileHistoryCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            repos: RwLock::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn file_for(&self, root: &Path) -> PathBuf {
        data_path_for(root, &self.base, CACHE_EXT)
    }

    /// In-memory slot for `root`, loading it from disk on first access.
    /// `None` when nothing is cached and `create` is false.
    fn slot(&self, root: &Path, create: Option<&dyn Repository>) -> Result<Option<Slot>, SyncError> {
        if let Some(slot) = self.repos.read()?.get(root) {
            return Ok(Some(slot.clone()));
        }

        let path = self.file_for(root);
        let loaded = if path.exists() {
            match load_compressed::<RepoHistory>(&path, "history") {
                Ok(mut data) if data.format_version == FORMAT_VERSION => {
                    data.reindex();
                    Some(data)
                }
                Ok(data) => {
                    warn!(repo = %root.display(), version = data.format_version, "History cache format changed, discarding");
                    None
                }
                Err(e) => {
                    warn!(repo = %root.display(), error = %e, "Unreadable history cache, discarding");
                    None
                }
            }
        } else {
            None
        };

        let data = match (loaded, create) {
            (Some(data), _) => data,
            (None, Some(repo)) => RepoHistory::new(repo),
            (None, None) => return Ok(None),
        };

        let mut repos = self.repos.write()?;
        let slot = repos
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(data)))
            .clone();
        Ok(Some(slot))
    }

    fn persist(&self, data: &RepoHistory) -> Result<(), SyncError> {
        save_compressed(&self.file_for(&data.repo_root), data, "history")
    }

    /// Cached repository whose root contains `path` (longest match).
    fn owning_root(&self, path: &Path) -> Result<Option<PathBuf>, SyncError> {
        let repos = self.repos.read()?;
        Ok(repos
            .keys()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.as_os_str().len())
            .cloned())
    }

    /// Roots currently held in memory.
    pub fn cached_repositories(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .repos
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        roots.sort();
        roots
    }
}

impl HistoryCache for FileHistoryCache {
    fn supports_repository(&self, repo: &dyn Repository) -> bool {
        repo.is_working()
    }

    fn get(&self, path: &Path, repo: &dyn Repository, with_files: bool) -> Result<Option<History>, SyncError> {
        let Some(slot) = self.slot(repo.root(), None)? else {
            return Ok(None);
        };
        let data = slot.read()?;
        if data.commits.is_empty() {
            return Ok(None);
        }
        let rel = repo_relative(repo.root(), path);
        Ok(data.query(&rel, with_files))
    }

    fn has_cache_for_directory(&self, dir: &Path, repo: &dyn Repository) -> bool {
        if !dir.starts_with(repo.root()) {
            return false;
        }
        self.latest_cached_revision(repo).is_some()
    }

    fn latest_cached_revision(&self, repo: &dyn Repository) -> Option<String> {
        let slot = self.slot(repo.root(), None).ok()??;
        let data = slot.read().ok()?;
        data.latest_revision().map(str::to_string)
    }

    fn store(&self, history: &History, repo: &dyn Repository) -> Result<(), SyncError> {
        if history.is_empty() {
            debug!(repo = %repo.root().display(), "Nothing to store");
            return Ok(());
        }
        let Some(slot) = self.slot(repo.root(), Some(repo))? else {
            return Ok(());
        };
        let mut data = slot.write()?;
        data.merge(history);
        self.persist(&data)?;
        debug!(
            repo = %repo.root().display(),
            stored = history.len(),
            total = data.commits.len(),
            "History stored"
        );
        Ok(())
    }

    fn clear(&self, repo: &dyn Repository) -> Result<(), SyncError> {
        self.repos.write()?.remove(repo.root());
        let path = self.file_for(repo.root());
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(repo = %repo.root().display(), "History cache cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_file(&self, path: &Path) -> Result<(), SyncError> {
        let Some(root) = self.owning_root(path)? else {
            return Ok(());
        };
        let Some(slot) = self.slot(&root, None)? else {
            return Ok(());
        };
        let rel = repo_relative(&root, path);
        let mut data = slot.write()?;
        if data.forget_file(&rel) {
            self.persist(&data)?;
            debug!(file = %path.display(), "File history cleared");
        }
        Ok(())
    }

    fn optimize(&self) -> Result<(), SyncError> {
        let start = Instant::now();
        let slots: Vec<Slot> = self.repos.read()?.values().cloned().collect();
        let mut removed = 0;
        for slot in &slots {
            let mut data = slot.write()?;
            let dropped = data.compact();
            if dropped > 0 {
                self.persist(&data)?;
            }
            removed += dropped;
        }
        info!(
            repositories = slots.len(),
            duplicates_removed = removed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "History cache optimized"
        );
        Ok(())
    }

    fn info(&self) -> String {
        let repos = match self.repos.read() {
            Ok(r) => r,
            Err(_) => return "FileHistoryCache (unavailable)".to_string(),
        };
        let commits: usize = repos
            .values()
            .filter_map(|s| s.read().ok().map(|d| d.commits.len()))
            .sum();
        format!(
            "FileHistoryCache at {}: {} repositories loaded, {} commits",
            self.base.display(),
            repos.len(),
            commits
        )
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
