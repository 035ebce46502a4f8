//! Version-control backends.
//!
//! Every backend implements [`Repository`]. Detection walks the static
//! [`BackendKind::ALL`] table in order; the first backend whose marker is
//! present owns the directory. Backend operations shell out through
//! [`command::CommandExecutor`], which enforces the configured timeout.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::history::{natural_cmp, Annotation, History, HistoryEntry, TagEntry, TagList};

pub mod command;
pub mod git;
pub mod mercurial;
pub mod subversion;

use command::CommandExecutor;

/// Directories containing this file are never treated as (or searched for)
/// repositories.
pub const SKIP_HISTORY_MARKER: &str = ".reposync-skip-history";

// ─── Descriptor ─────────────────────────────────────────────────────

/// Identity snapshot of a detected repository. Immutable once built;
/// refreshed only by running detection again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Canonical absolute path of the working copy root.
    pub path: PathBuf,
    /// Backend tag (`git`, `hg`, `svn`, ...).
    pub kind: String,
    /// Upstream URL.
    pub parent: Option<String>,
    pub branch: Option<String>,
    /// Free-form summary of the checked-out revision.
    pub current_version: Option<String>,
    pub is_remote: bool,
    /// False when the backend's command is not usable on this host.
    pub is_working: bool,
}

impl RepositoryDescriptor {
    /// Descriptor with only identity fields set, before metadata resolution.
    pub fn bare(path: impl Into<PathBuf>, kind: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: kind.into(),
            parent: None,
            branch: None,
            current_version: None,
            is_remote: false,
            is_working: true,
        }
    }
}

// ─── Backend contract ───────────────────────────────────────────────

/// One repository handle bound to one working copy.
///
/// Paths passed to the query methods are absolute paths inside
/// [`Repository::root`]. Optional capabilities have conservative defaults.
pub trait Repository: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &RepositoryDescriptor;

    fn root(&self) -> &Path {
        &self.descriptor().path
    }

    fn kind(&self) -> &str {
        &self.descriptor().kind
    }

    fn is_working(&self) -> bool {
        self.descriptor().is_working
    }

    fn is_remote(&self) -> bool {
        self.descriptor().is_remote
    }

    /// Full history of a file or directory, most recent first.
    fn history(&self, path: &Path) -> Result<History, SyncError>;

    /// Entries strictly newer than `since`.
    ///
    /// The default fetches the full history and cuts it at the boundary,
    /// failing with `CacheInconsistency` when `since` is not found.
    fn history_since(&self, path: &Path, since: &str) -> Result<History, SyncError> {
        self.history(path)?.truncate_since(since, self.root())
    }

    /// Blame a file at `revision` (working copy revision when `None`).
    fn annotate(&self, path: &Path, revision: Option<&str>) -> Result<Annotation, SyncError>;

    /// Pull the latest upstream changes into the working copy.
    fn update(&self) -> Result<(), SyncError> {
        Err(SyncError::unsupported(self.kind(), "update"))
    }

    fn determine_parent(&self) -> Result<Option<String>, SyncError> {
        Ok(None)
    }

    fn determine_branch(&self) -> Result<Option<String>, SyncError> {
        Ok(None)
    }

    fn determine_current_version(&self) -> Result<Option<String>, SyncError> {
        Ok(None)
    }

    fn determine_remote(&self) -> Result<bool, SyncError> {
        Ok(false)
    }

    /// Whether the backend command can run on this host.
    fn determine_working(&self) -> bool {
        true
    }

    /// When false, cache population queries file by file.
    fn has_history_for_directories(&self) -> bool {
        true
    }

    fn file_has_history(&self, _path: &Path) -> bool {
        true
    }

    fn file_has_annotation(&self, path: &Path) -> bool {
        self.file_has_history(path)
    }

    fn supports_sub_repositories(&self) -> bool {
        false
    }

    /// Tags mark only the tagged changeset; inheritance onto older entries
    /// is computed by [`crate::history::assign_tags`].
    fn has_file_based_tags(&self) -> bool {
        false
    }

    /// Rebuild the tag list. Called once per cache population pass.
    fn build_tag_list(&self) -> Result<(), SyncError> {
        Ok(())
    }

    fn tag_list(&self) -> Option<TagList> {
        None
    }

    /// Order a tag against a history entry.
    fn compare_tag(&self, tag: &TagEntry, entry: &HistoryEntry) -> Ordering {
        natural_cmp(&tag.revision, &entry.revision)
    }

    /// Revision spelling the backend's annotate command expects.
    fn revision_for_annotate(&self, revision: &str) -> String {
        revision.to_string()
    }

    /// Directory names that belong to the backend's metadata.
    fn ignored_dirs(&self) -> &'static [&'static str] {
        &[]
    }

    /// File names that belong to the backend's metadata.
    fn ignored_files(&self) -> &'static [&'static str] {
        &[]
    }
}

// ─── Backend table ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Mercurial,
    Git,
    Subversion,
}

impl BackendKind {
    /// Detection order. The first backend to match a directory wins.
    pub const ALL: [BackendKind; 3] = [BackendKind::Mercurial, BackendKind::Git, BackendKind::Subversion];

    pub fn tag(self) -> &'static str {
        match self {
            BackendKind::Mercurial => "hg",
            BackendKind::Git => "git",
            BackendKind::Subversion => "svn",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Metadata directory (or file, for git worktrees) marking a working copy.
    pub fn marker(self) -> &'static str {
        match self {
            BackendKind::Mercurial => ".hg",
            BackendKind::Git => ".git",
            BackendKind::Subversion => ".svn",
        }
    }

    fn default_command(self) -> &'static str {
        match self {
            BackendKind::Mercurial => "hg",
            BackendKind::Git => "git",
            BackendKind::Subversion => "svn",
        }
    }

    /// Cheap local check: marker present, no process execution.
    pub fn probe(self, dir: &Path) -> bool {
        dir.join(self.marker()).exists()
    }

    /// Executor for this backend honoring the command override and timeout.
    pub fn executor(self, config: &Config) -> CommandExecutor {
        CommandExecutor::new(
            config.command_for(self.tag(), self.default_command()),
            config.command_timeout(),
        )
    }

    /// Build the backend for `root` and resolve its metadata.
    pub fn open(self, root: &Path, config: &Config) -> Arc<dyn Repository> {
        let bare = RepositoryDescriptor::bare(root, self.tag());
        let exec = self.executor(config);
        match self {
            BackendKind::Mercurial => {
                open_with(bare, |d| mercurial::MercurialRepository::new(d, exec.clone()))
            }
            BackendKind::Git => open_with(bare, |d| git::GitRepository::new(d, exec.clone())),
            BackendKind::Subversion => {
                open_with(bare, |d| subversion::SubversionRepository::new(d, exec.clone()))
            }
        }
    }
}

/// All backend metadata directory names.
pub fn metadata_dir_names() -> impl Iterator<Item = &'static str> {
    BackendKind::ALL.into_iter().map(BackendKind::marker)
}

/// Signature of a repository detector. The registry uses [`detect`] unless a
/// different detector is injected.
pub type DetectFn = dyn Fn(&Path, &Config) -> Result<Option<Arc<dyn Repository>>, SyncError> + Send + Sync;

/// Detect the repository rooted exactly at `dir`.
pub fn detect(dir: &Path, config: &Config) -> Result<Option<Arc<dyn Repository>>, SyncError> {
    let canonical = std::fs::canonicalize(dir).map_err(|e| SyncError::Detection {
        path: dir.display().to_string(),
        message: e.to_string(),
    })?;
    for kind in BackendKind::ALL {
        if kind.probe(&canonical) {
            debug!(dir = %canonical.display(), backend = kind.tag(), "Repository detected");
            return Ok(Some(kind.open(&canonical, config)));
        }
    }
    Ok(None)
}

fn open_with<R, F>(bare: RepositoryDescriptor, make: F) -> Arc<dyn Repository>
where
    R: Repository + 'static,
    F: Fn(RepositoryDescriptor) -> R,
{
    let probe = make(bare);
    let descriptor = resolve_metadata(&probe);
    Arc::new(make(descriptor))
}

/// Run the best-effort metadata queries. Failures leave the field unset.
pub fn resolve_metadata(repo: &dyn Repository) -> RepositoryDescriptor {
    let mut descriptor = repo.descriptor().clone();
    let root = descriptor.path.display().to_string();

    descriptor.is_working = repo.determine_working();
    if !descriptor.is_working {
        warn!(repo = %root, backend = %descriptor.kind, "Backend command unavailable, repository is not working");
        return descriptor;
    }

    descriptor.parent = repo.determine_parent().unwrap_or_else(|e| {
        warn!(repo = %root, error = %e, "Failed to determine parent");
        None
    });
    descriptor.branch = repo.determine_branch().unwrap_or_else(|e| {
        warn!(repo = %root, error = %e, "Failed to determine branch");
        None
    });
    descriptor.current_version = repo.determine_current_version().unwrap_or_else(|e| {
        warn!(repo = %root, error = %e, "Failed to determine current version");
        None
    });
    descriptor.is_remote = repo.determine_remote().unwrap_or_else(|e| {
        warn!(repo = %root, error = %e, "Failed to determine remote status");
        false
    });
    descriptor
}

/// An incremental fetch that failed because the backend no longer knows the
/// `since` revision is a cache inconsistency; every other error is kept.
pub(crate) fn boundary_error(e: SyncError, root: &Path, since: &str) -> SyncError {
    match &e {
        SyncError::CommandFailed { stderr, .. } if names_missing_revision(stderr) => SyncError::CacheInconsistency {
            repo: root.display().to_string(),
            revision: since.to_string(),
        },
        _ => e,
    }
}

fn names_missing_revision(stderr: &str) -> bool {
    const MARKERS: [&str; 4] = ["unknown revision", "bad revision", "invalid revision range", "no such revision"];
    let stderr = stderr.to_lowercase();
    MARKERS.iter().any(|m| stderr.contains(m))
}

/// `path` relative to `root`, `/`-separated. Empty for the root itself.
pub(crate) fn repo_relative(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => crate::to_slash(rel),
        Err(_) => {
            let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            canonical
                .strip_prefix(root)
                .map(crate::to_slash)
                .unwrap_or_default()
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "vcs_tests.rs"]
mod tests;
