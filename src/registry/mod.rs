//! Repository registry: discovery, path → repository lookup, history access
//! and cache population.
//!
//! The registry is an explicit context object shared as `Arc`. The
//! repository map is held as an `Arc` snapshot behind a `RwLock` and is only
//! ever replaced as a whole, so readers never observe a half-built map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use ignore::WalkBuilder;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, RemoteScm};
use crate::error::SyncError;
use crate::history::cache::{FileHistoryCache, HistoryCache};
use crate::history::{assign_tags, Annotation, History};
use crate::names::NameFilter;
use crate::vcs::{self, metadata_dir_names, DetectFn, Repository, RepositoryDescriptor, SKIP_HISTORY_MARKER};

pub mod pool;

type RepoMap = HashMap<PathBuf, Arc<dyn Repository>>;

/// Outcome of a cache population run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheReport {
    /// Repositories whose history was stored.
    pub repositories: usize,
    /// History entries fetched across all repositories.
    pub entries: usize,
    /// Roots whose population failed.
    pub failed: Vec<PathBuf>,
    pub elapsed_ms: u64,
}

/// Outcome of [`RepositoryRegistry::update_repositories`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct UpdateReport {
    pub updated: Vec<PathBuf>,
    pub unsupported: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

pub struct RepositoryRegistry {
    config: Arc<Config>,
    cache: Option<Arc<dyn HistoryCache>>,
    repositories: RwLock<Arc<RepoMap>>,
    detector: Arc<DetectFn>,
}

impl std::fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryRegistry")
            .field("repositories", &self.len())
            .field("cache", &self.cache.as_ref().map(|c| c.info()))
            .finish()
    }
}

impl RepositoryRegistry {
    /// Registry with the stock backend table and, when history caching is
    /// enabled, a [`FileHistoryCache`] under the data root.
    pub fn new(config: Arc<Config>) -> Self {
        let cache: Option<Arc<dyn HistoryCache>> = if config.history_enabled && config.history_cache {
            Some(Arc::new(FileHistoryCache::new(config.history_cache_root())))
        } else {
            None
        };
        Self::with_parts(config, cache, Arc::new(vcs::detect))
    }

    pub fn with_parts(config: Arc<Config>, cache: Option<Arc<dyn HistoryCache>>, detector: Arc<DetectFn>) -> Self {
        Self {
            config,
            cache,
            repositories: RwLock::new(Arc::new(HashMap::new())),
            detector,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<dyn HistoryCache>> {
        self.cache.as_ref()
    }

    fn snapshot(&self) -> Arc<RepoMap> {
        match self.repositories.read() {
            Ok(map) => map.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap(&self, map: RepoMap) -> Result<(), SyncError> {
        *self.repositories.write()? = Arc::new(map);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Descriptors of all registered repositories, sorted by path.
    pub fn repositories(&self) -> Vec<RepositoryDescriptor> {
        self.handles().iter().map(|r| r.descriptor().clone()).collect()
    }

    /// Registered repository handles, sorted by root.
    pub fn handles(&self) -> Vec<Arc<dyn Repository>> {
        let mut repos: Vec<Arc<dyn Repository>> = self.snapshot().values().cloned().collect();
        repos.sort_by(|a, b| a.root().cmp(b.root()));
        repos
    }

    /// Repositories inside `dir` plus the one containing it.
    pub fn repositories_for(&self, dir: &Path) -> Vec<Arc<dyn Repository>> {
        let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.handles()
            .into_iter()
            .filter(|r| r.root().starts_with(&dir) || dir.starts_with(r.root()))
            .collect()
    }

    // ─── Discovery ──────────────────────────────────────────────────

    /// Find repositories under `roots` and merge them into the registry.
    ///
    /// A root has depth 0; a directory at depth `d` is probed only when
    /// `d <= max_depth`. Nothing below a detected repository is searched,
    /// except that backends supporting sub-repositories get their immediate
    /// children probed once.
    pub fn discover(
        &self,
        roots: &[PathBuf],
        ignored: &NameFilter,
        max_depth: usize,
    ) -> Result<Vec<RepositoryDescriptor>, SyncError> {
        let start = Instant::now();
        let mut found: Vec<Arc<dyn Repository>> = Vec::new();
        for root in roots {
            self.discover_in(root, ignored, max_depth, 0, &mut found);
        }

        let mut map: RepoMap = (*self.snapshot()).clone();
        for repo in &found {
            map.insert(repo.root().to_path_buf(), repo.clone());
        }
        self.swap(map)?;

        let mut descriptors: Vec<RepositoryDescriptor> = found.iter().map(|r| r.descriptor().clone()).collect();
        descriptors.sort_by(|a, b| a.path.cmp(&b.path));
        descriptors.dedup_by(|a, b| a.path == b.path);
        info!(
            roots = roots.len(),
            found = descriptors.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Repository discovery done"
        );
        Ok(descriptors)
    }

    fn discover_in(
        &self,
        dir: &Path,
        ignored: &NameFilter,
        max_depth: usize,
        depth: usize,
        found: &mut Vec<Arc<dyn Repository>>,
    ) {
        if depth > max_depth {
            return;
        }
        if dir.join(SKIP_HISTORY_MARKER).exists() {
            debug!(dir = %dir.display(), "Skip marker present, not searching");
            return;
        }

        if let Some(repo) = self.probe(dir) {
            if repo.supports_sub_repositories() {
                for child in child_dirs(dir, ignored) {
                    if child.join(SKIP_HISTORY_MARKER).exists() {
                        continue;
                    }
                    if let Some(sub) = self.probe(&child) {
                        debug!(parent = %repo.root().display(), sub = %sub.root().display(), "Sub-repository found");
                        found.push(sub);
                    }
                }
            }
            found.push(repo);
            return;
        }

        for child in child_dirs(dir, ignored) {
            self.discover_in(&child, ignored, max_depth, depth + 1, found);
        }
    }

    /// Run the detector; failures are logged and treated as "not a repository".
    fn probe(&self, dir: &Path) -> Option<Arc<dyn Repository>> {
        match (self.detector)(dir, self.config.as_ref()) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Repository detection failed");
                None
            }
        }
    }

    // ─── Lookup ─────────────────────────────────────────────────────

    /// Repository owning `path`: the registered root equal to `path` or
    /// its nearest ancestor.
    pub fn resolve(&self, path: &Path) -> Option<Arc<dyn Repository>> {
        let map = self.snapshot();
        if map.is_empty() {
            return None;
        }
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        canonical.ancestors().find_map(|p| map.get(p).cloned())
    }

    /// Remote repositories are consulted according to `remote_scm`.
    fn fetch_allowed(&self, repo: &dyn Repository, ui: bool) -> bool {
        if !repo.is_remote() {
            return true;
        }
        match self.config.remote_scm {
            RemoteScm::On => true,
            RemoteScm::Off => false,
            RemoteScm::DirBased => repo.has_history_for_directories(),
            RemoteScm::UiOnly => ui,
        }
    }

    pub fn has_history(&self, path: &Path) -> bool {
        if !self.config.history_enabled {
            return false;
        }
        let Some(repo) = self.resolve(path) else {
            return false;
        };
        if !repo.is_working() || !self.fetch_allowed(repo.as_ref(), false) {
            return false;
        }
        if path.is_dir() {
            repo.has_history_for_directories()
        } else {
            repo.file_has_history(path)
        }
    }

    pub fn has_annotation(&self, path: &Path) -> bool {
        if path.is_dir() {
            return false;
        }
        let Some(repo) = self.resolve(path) else {
            return false;
        };
        repo.is_working() && repo.file_has_annotation(path)
    }

    // ─── History access ─────────────────────────────────────────────

    /// History of a file or directory, cache first.
    ///
    /// `ui` marks interactive requests, which `remote_scm = uionly` allows.
    /// `None` when history is disabled, the path is unversioned, or the
    /// cache has nothing and backend fallback is off.
    pub fn get_history(&self, path: &Path, with_files: bool, ui: bool) -> Result<Option<History>, SyncError> {
        if !self.config.history_enabled {
            return Ok(None);
        }
        let Some(repo) = self.resolve(path) else {
            return Ok(None);
        };
        if !repo.is_working() || !self.fetch_allowed(repo.as_ref(), ui) {
            return Ok(None);
        }
        if path.is_dir() && !repo.has_history_for_directories() {
            return Ok(None);
        }

        let mut history = match self.cached_history(path, repo.as_ref(), with_files) {
            Some(history) => history,
            None if self.cache_in_use(repo.as_ref()) && !self.config.fetch_history_when_not_in_cache => {
                return Ok(None);
            }
            None => {
                let mut history = repo.history(path)?;
                if !with_files {
                    history.strip_files();
                }
                history
            }
        };
        self.apply_tags(repo.as_ref(), &mut history);
        Ok(Some(history))
    }

    fn cache_in_use(&self, repo: &dyn Repository) -> bool {
        self.cache.as_ref().is_some_and(|c| c.supports_repository(repo))
    }

    fn cached_history(&self, path: &Path, repo: &dyn Repository, with_files: bool) -> Option<History> {
        let cache = self.cache.as_ref().filter(|c| c.supports_repository(repo))?;
        match cache.get(path, repo, with_files) {
            Ok(history) => history,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "History cache lookup failed");
                None
            }
        }
    }

    fn apply_tags(&self, repo: &dyn Repository, history: &mut History) {
        if !self.config.tags_enabled || !repo.has_file_based_tags() {
            return;
        }
        if repo.tag_list().is_none() {
            if let Err(e) = repo.build_tag_list() {
                warn!(repo = %repo.root().display(), error = %e, "Failed to build tag list");
                return;
            }
        }
        if let Some(tags) = repo.tag_list() {
            assign_tags(history, &tags, |t, e| repo.compare_tag(t, e));
        }
    }

    /// Blame `path`, with revision descriptions cross-referenced from its
    /// history when available.
    pub fn annotate(&self, path: &Path, revision: Option<&str>) -> Result<Option<Annotation>, SyncError> {
        if !self.has_annotation(path) {
            return Ok(None);
        }
        let Some(repo) = self.resolve(path) else {
            return Ok(None);
        };
        let revision = revision.map(|r| repo.revision_for_annotate(r));
        let mut annotation = repo.annotate(path, revision.as_deref())?;
        match self.get_history(path, false, true) {
            Ok(Some(history)) => annotation.cross_reference(&history),
            Ok(None) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "No history for annotation"),
        }
        Ok(Some(annotation))
    }

    // ─── Cache population ───────────────────────────────────────────

    /// Bring the cache up to date for every repository relevant to `dir`.
    pub fn ensure_cache_up_to_date(&self, dir: &Path) -> Result<CacheReport, SyncError> {
        let repos = self.repositories_for(dir);
        if repos.is_empty() {
            return Ok(CacheReport::default());
        }
        self.create_cache(&repos)
    }

    pub fn create_cache_all(&self) -> Result<CacheReport, SyncError> {
        self.create_cache(&self.handles())
    }

    /// Populate the cache for `repos` concurrently.
    ///
    /// The latest cached revision of every repository is read before any
    /// work starts; the pool then fetches and stores each repository, and
    /// the cache is optimized once after all of them have finished.
    pub fn create_cache(&self, repos: &[Arc<dyn Repository>]) -> Result<CacheReport, SyncError> {
        let Some(cache) = self.cache.clone() else {
            return Ok(CacheReport::default());
        };
        let start = Instant::now();

        let work: Vec<(Arc<dyn Repository>, Option<String>)> = repos
            .iter()
            .filter(|r| {
                if !r.is_working() {
                    info!(repo = %r.root().display(), "Repository not working, skipping history");
                    return false;
                }
                cache.supports_repository(r.as_ref()) && self.fetch_allowed(r.as_ref(), false)
            })
            .map(|r| (r.clone(), cache.latest_cached_revision(r.as_ref())))
            .collect();

        let results = pool::run_bounded(&work, self.config.worker_count(), |(repo, since)| {
            self.populate(repo.as_ref(), cache.as_ref(), since.as_deref())
        });

        let mut report = CacheReport::default();
        for ((repo, _), result) in work.iter().zip(results) {
            match result {
                Ok(entries) => {
                    report.repositories += 1;
                    report.entries += entries;
                }
                Err(e) => {
                    warn!(repo = %repo.root().display(), error = %e, "History cache population failed");
                    report.failed.push(repo.root().to_path_buf());
                }
            }
        }

        if !work.is_empty() {
            if let Err(e) = cache.optimize() {
                warn!(error = %e, "History cache optimize failed");
            }
        }
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            repositories = report.repositories,
            entries = report.entries,
            failed = report.failed.len(),
            elapsed_ms = report.elapsed_ms,
            "History cache populated"
        );
        Ok(report)
    }

    fn populate(&self, repo: &dyn Repository, cache: &dyn HistoryCache, since: Option<&str>) -> Result<usize, SyncError> {
        let start = Instant::now();
        if self.config.tags_enabled && repo.has_file_based_tags() {
            if let Err(e) = repo.build_tag_list() {
                warn!(repo = %repo.root().display(), error = %e, "Failed to build tag list");
            }
        }

        let stored = if repo.has_history_for_directories() {
            let history = match since {
                Some(since) => match repo.history_since(repo.root(), since) {
                    Ok(history) => history,
                    // only a vanished boundary revision invalidates the cache
                    Err(e @ SyncError::CacheInconsistency { .. }) => {
                        warn!(
                            repo = %repo.root().display(),
                            since,
                            error = %e,
                            "Incremental history failed, rebuilding from scratch"
                        );
                        let history = repo.history(repo.root())?;
                        cache.clear(repo)?;
                        history
                    }
                    Err(e) => return Err(e),
                },
                None => repo.history(repo.root())?,
            };
            cache.store(&history, repo)?;
            history.len()
        } else {
            let mut stored = 0;
            for file in repository_files(repo) {
                match repo.history(&file) {
                    Ok(history) => {
                        cache.store(&history, repo)?;
                        stored += history.len();
                    }
                    Err(e) => warn!(file = %file.display(), error = %e, "File history failed"),
                }
            }
            stored
        };

        debug!(
            repo = %repo.root().display(),
            entries = stored,
            incremental = since.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Repository history cached"
        );
        Ok(stored)
    }

    // ─── Maintenance ────────────────────────────────────────────────

    /// Drop cached history of the repositories rooted at `roots`.
    /// Returns the roots that were cleared.
    pub fn clear_cache(&self, roots: &[PathBuf]) -> Vec<PathBuf> {
        let Some(cache) = self.cache.as_ref() else {
            return Vec::new();
        };
        let map = self.snapshot();
        let mut cleared = Vec::new();
        for root in roots {
            let key = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
            let Some(repo) = map.get(&key) else {
                warn!(root = %root.display(), "Not a registered repository");
                continue;
            };
            match cache.clear(repo.as_ref()) {
                Ok(()) => cleared.push(key),
                Err(e) => warn!(root = %root.display(), error = %e, "Failed to clear history cache"),
            }
        }
        cleared
    }

    pub fn clear_cache_file(&self, path: &Path) -> Result<(), SyncError> {
        match self.cache.as_ref() {
            Some(cache) => cache.clear_file(path),
            None => Ok(()),
        }
    }

    /// Forget repositories without touching their cached history.
    pub fn remove_repositories(&self, roots: &[PathBuf]) -> Result<usize, SyncError> {
        let mut map: RepoMap = (*self.snapshot()).clone();
        let before = map.len();
        for root in roots {
            let key = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
            map.remove(&key);
        }
        let removed = before - map.len();
        self.swap(map)?;
        Ok(removed)
    }

    /// Clear the cached history of `roots`, then forget them.
    pub fn remove_cache(&self, roots: &[PathBuf]) -> Result<Vec<PathBuf>, SyncError> {
        let cleared = self.clear_cache(roots);
        self.remove_repositories(roots)?;
        Ok(cleared)
    }

    /// Pull upstream changes. `None` updates every registered repository.
    pub fn update_repositories(&self, roots: Option<&[PathBuf]>) -> UpdateReport {
        let repos: Vec<Arc<dyn Repository>> = match roots {
            None => self.handles(),
            Some(roots) => {
                let wanted: Vec<PathBuf> = roots
                    .iter()
                    .map(|r| std::fs::canonicalize(r).unwrap_or_else(|_| r.clone()))
                    .collect();
                self.handles()
                    .into_iter()
                    .filter(|r| wanted.iter().any(|w| w == r.root()))
                    .collect()
            }
        };

        let results = pool::run_bounded(&repos, self.config.worker_count(), |repo| repo.update());
        let mut report = UpdateReport::default();
        for (repo, result) in repos.iter().zip(results) {
            let root = repo.root().to_path_buf();
            match result {
                Ok(()) => {
                    info!(repo = %root.display(), "Repository updated");
                    report.updated.push(root);
                }
                Err(e) if e.is_unsupported() => {
                    info!(repo = %root.display(), reason = %e, "Update skipped");
                    report.unsupported.push(root);
                }
                Err(e) => {
                    warn!(repo = %root.display(), error = %e, "Repository update failed");
                    report.failed.push(root);
                }
            }
        }
        report
    }

    // ─── Invalidation ───────────────────────────────────────────────

    /// Rebuild the registry from `descriptors` by re-running detection on
    /// each path concurrently. The map is replaced only after every
    /// detection finished. Empty input clears the registry.
    pub fn invalidate(&self, descriptors: &[RepositoryDescriptor]) -> Result<usize, SyncError> {
        if descriptors.is_empty() {
            self.swap(HashMap::new())?;
            info!("Repository registry cleared");
            return Ok(0);
        }
        let start = Instant::now();
        let results = pool::run_bounded(descriptors, self.config.worker_count(), |d| {
            (self.detector)(&d.path, self.config.as_ref())
        });

        let mut map: RepoMap = HashMap::with_capacity(descriptors.len());
        for (descriptor, result) in descriptors.iter().zip(results) {
            match result {
                Ok(Some(repo)) => {
                    map.insert(repo.root().to_path_buf(), repo);
                }
                Ok(None) => warn!(path = %descriptor.path.display(), "No longer a repository"),
                Err(e) => warn!(path = %descriptor.path.display(), error = %e, "Re-detection failed"),
            }
        }
        let count = map.len();
        self.swap(map)?;
        info!(
            requested = descriptors.len(),
            registered = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Repository registry rebuilt"
        );
        Ok(count)
    }

    /// Like [`invalidate`](Self::invalidate), keeping only descriptors whose
    /// path lies under one of `dirs`.
    pub fn invalidate_under(&self, descriptors: &[RepositoryDescriptor], dirs: &[PathBuf]) -> Result<usize, SyncError> {
        let kept: Vec<RepositoryDescriptor> = descriptors
            .iter()
            .filter(|d| dirs.iter().any(|dir| d.path.starts_with(dir)))
            .cloned()
            .collect();
        self.invalidate(&kept)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Subdirectories of `dir`, sorted, minus ignored and backend metadata
/// directories. Symlinks are not followed.
fn child_dirs(dir: &Path, ignored: &NameFilter) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot list directory");
            return Vec::new();
        }
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| {
            let is_metadata = p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| metadata_dir_names().any(|m| m == n));
            !is_metadata && !ignored.matches_dir(p)
        })
        .collect();
    dirs.sort();
    dirs
}

/// Regular files of a working copy, skipping the backend's own metadata.
fn repository_files(repo: &dyn Repository) -> Vec<PathBuf> {
    let ignored_dirs = repo.ignored_dirs();
    let ignored_files = repo.ignored_files();
    let mut builder = WalkBuilder::new(repo.root());
    builder.hidden(false);
    builder.git_ignore(false);
    builder.git_global(false);
    builder.git_exclude(false);
    builder.filter_entry(move |entry| {
        let name = entry.file_name().to_string_lossy();
        let skip = if entry.file_type().is_some_and(|t| t.is_dir()) {
            ignored_dirs
        } else {
            ignored_files
        };
        !skip.iter().any(|s| *s == name.as_ref())
    });

    let mut files: Vec<PathBuf> = builder
        .build()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
