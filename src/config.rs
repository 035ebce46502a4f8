//! Configuration snapshot consumed by the registry, the history cache and the
//! index databases. Built once at the start of a run (JSON file and/or CLI
//! flags) and then shared read-only as `Arc<Config>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::DEFAULT_MIN_TOKEN_LEN;

/// Default timeout for a single external VCS command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Default directory scanning depth for repository discovery.
pub const DEFAULT_SCANNING_DEPTH: usize = 3;

/// When history of repositories that are not local is fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteScm {
    /// Always fetch history of remote repositories.
    On,
    /// Never fetch history of remote repositories.
    #[default]
    Off,
    /// Fetch when the backend can produce history for whole directories.
    DirBased,
    /// Only for interactive (UI) requests.
    UiOnly,
}

/// A named subtree of the source root with its own index database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Path relative to the source root, starting with `/`.
    pub path: String,
}

impl Project {
    /// Find the project whose path contains `rel_path` (longest match wins).
    pub fn find<'a>(projects: &'a [Project], rel_path: &str) -> Option<&'a Project> {
        projects
            .iter()
            .filter(|p| rel_path == p.path || rel_path.starts_with(&format!("{}/", p.path)))
            .max_by_key(|p| p.path.len())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the source tree.
    pub source_root: PathBuf,
    /// Where index databases, xrefs and the history cache are stored.
    pub data_root: PathBuf,
    /// Ignore patterns. Plain globs match both files and directories,
    /// `f:<glob>` only files, `d:<glob>` only directories.
    pub ignored_names: Vec<String>,
    /// If non-empty, only files matching one of these globs are indexed.
    pub included_names: Vec<String>,
    /// Maximum directory depth probed during repository discovery.
    pub scanning_depth: usize,
    /// Per-backend executable override, keyed by backend tag (`git`, `hg`, `svn`).
    pub commands: HashMap<String, String>,
    pub command_timeout_secs: u64,
    /// Skip files that the registry reports as having no history.
    pub index_versioned_files_only: bool,
    /// Query the backend directly when the cache has nothing for a file.
    pub fetch_history_when_not_in_cache: bool,
    pub history_enabled: bool,
    pub history_cache: bool,
    pub tags_enabled: bool,
    pub remote_scm: RemoteScm,
    pub generate_xref: bool,
    pub compress_xref: bool,
    pub optimize_database: bool,
    /// Count the files of a pass up front and log progress against the total.
    pub print_progress: bool,
    /// Symlinks (absolute paths) that may point outside the source root.
    pub allowed_symlinks: Vec<PathBuf>,
    pub projects: Vec<Project>,
    /// Worker count for cache population and invalidation (0 = auto).
    pub history_threads: usize,
    pub min_token_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            data_root: default_data_root(),
            ignored_names: Vec::new(),
            included_names: Vec::new(),
            scanning_depth: DEFAULT_SCANNING_DEPTH,
            commands: HashMap::new(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            index_versioned_files_only: false,
            fetch_history_when_not_in_cache: true,
            history_enabled: true,
            history_cache: true,
            tags_enabled: false,
            remote_scm: RemoteScm::Off,
            generate_xref: true,
            compress_xref: true,
            optimize_database: true,
            print_progress: false,
            allowed_symlinks: Vec::new(),
            projects: Vec::new(),
            history_threads: 0,
            min_token_len: DEFAULT_MIN_TOKEN_LEN,
        }
    }
}

/// Default production data directory: `<local data dir>/reposync`.
/// Tests should NOT use this. Pass a test-local directory instead.
pub fn default_data_root() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("reposync")
}

impl Config {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path).map_err(|e| SyncError::Config {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| SyncError::Config {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    /// Executable for a backend: the configured override or the fallback name.
    pub fn command_for(&self, backend_tag: &str, fallback: &str) -> String {
        self.commands
            .get(backend_tag)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Worker count for the history pools.
    pub fn worker_count(&self) -> usize {
        if self.history_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.history_threads
        }
    }

    pub fn has_projects(&self) -> bool {
        !self.projects.is_empty()
    }

    pub fn index_root(&self) -> PathBuf {
        self.data_root.join("index")
    }

    pub fn xref_root(&self) -> PathBuf {
        self.data_root.join("xref")
    }

    pub fn history_cache_root(&self) -> PathBuf {
        self.data_root.join("historycache")
    }

    /// Path of `file` relative to the source root, `/`-separated with a leading `/`.
    /// `None` when the file is outside the source root.
    pub fn relative_to_source_root(&self, file: &Path) -> Option<String> {
        let root = std::fs::canonicalize(&self.source_root)
            .unwrap_or_else(|_| self.source_root.clone());
        let file = std::fs::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());
        let rel = file.strip_prefix(&root).ok()?;
        let rel = crate::to_slash(rel);
        if rel.is_empty() {
            Some(String::new())
        } else {
            Some(format!("/{}", rel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scanning_depth, DEFAULT_SCANNING_DEPTH);
        assert_eq!(config.command_timeout(), Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS));
        assert!(config.history_enabled);
        assert!(!config.index_versioned_files_only);
        assert_eq!(config.remote_scm, RemoteScm::Off);
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"source_root": "/src", "scanning_depth": 5, "commands": {"git": "/opt/git/bin/git"}, "remote_scm": "dirbased"}"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.source_root, PathBuf::from("/src"));
        assert_eq!(config.scanning_depth, 5);
        assert_eq!(config.command_for("git", "git"), "/opt/git/bin/git");
        assert_eq!(config.command_for("hg", "hg"), "hg");
        assert_eq!(config.remote_scm, RemoteScm::DirBased);
        // untouched fields keep defaults
        assert_eq!(config.min_token_len, DEFAULT_MIN_TOKEN_LEN);
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn test_worker_count_explicit() {
        let config = Config { history_threads: 3, ..Config::default() };
        assert_eq!(config.worker_count(), 3);
        assert!(Config::default().worker_count() >= 1);
    }

    #[test]
    fn test_project_find_longest_match() {
        let projects = vec![
            Project { name: "a".into(), path: "/a".into() },
            Project { name: "ab".into(), path: "/a/b".into() },
        ];
        assert_eq!(Project::find(&projects, "/a/b/c.txt").unwrap().name, "ab");
        assert_eq!(Project::find(&projects, "/a/x.txt").unwrap().name, "a");
        assert!(Project::find(&projects, "/ab/x.txt").is_none());
    }

    #[test]
    fn test_relative_to_source_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proj/src")).unwrap();
        std::fs::write(dir.path().join("proj/src/main.c"), "int main;").unwrap();
        let config = Config { source_root: dir.path().to_path_buf(), ..Config::default() };
        assert_eq!(
            config.relative_to_source_root(&dir.path().join("proj/src/main.c")).as_deref(),
            Some("/proj/src/main.c")
        );
        assert_eq!(config.relative_to_source_root(dir.path()).as_deref(), Some(""));
        assert!(config.relative_to_source_root(Path::new("/definitely/elsewhere")).is_none());
    }
}
