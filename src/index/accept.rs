//! Acceptance filter applied to every entry of the live tree walk.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{Config, Project};
use crate::error::SyncError;
use crate::names::NameFilter;
use crate::registry::RepositoryRegistry;

/// Decides which files and directories take part in a synchronization pass.
pub struct AcceptFilter {
    /// Canonical root that symlink targets must stay inside.
    local_root: PathBuf,
    included: NameFilter,
    ignored: NameFilter,
    /// `(link path, canonical target)` pairs.
    allowed_symlinks: Vec<(PathBuf, PathBuf)>,
    /// Set when only files with history are indexed.
    versioned_only: Option<Arc<RepositoryRegistry>>,
}

impl AcceptFilter {
    /// Filter for `project` (or the whole source root).
    pub fn new(
        config: &Config,
        project: Option<&Project>,
        registry: Arc<RepositoryRegistry>,
    ) -> Result<Self, SyncError> {
        let source_root = std::fs::canonicalize(&config.source_root)?;
        let local_root = match project {
            Some(p) => {
                let root = source_root.join(p.path.trim_start_matches('/'));
                std::fs::canonicalize(&root).unwrap_or(root)
            }
            None => source_root,
        };
        let allowed_symlinks = config
            .allowed_symlinks
            .iter()
            .filter_map(|link| match std::fs::canonicalize(link) {
                Ok(target) => Some((link.clone(), target)),
                Err(e) => {
                    warn!(link = %link.display(), error = %e, "Allowed symlink cannot be resolved");
                    None
                }
            })
            .collect();
        let versioned_only = (config.index_versioned_files_only && config.history_enabled).then_some(registry);
        Ok(Self {
            local_root,
            included: NameFilter::new(&config.included_names)?,
            ignored: NameFilter::ignored(&config.ignored_names)?,
            allowed_symlinks,
            versioned_only,
        })
    }

    /// Whether `path` is indexed (files) or descended into (directories).
    /// Returns the followed metadata of accepted entries.
    pub fn accept(&self, path: &Path) -> Option<Metadata> {
        let link_meta = std::fs::symlink_metadata(path).ok()?;
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Dangling entry");
                return None;
            }
        };
        let is_dir = meta.is_dir();

        if !is_dir && !self.included.is_empty() && !self.included.matches_file(path) {
            return None;
        }
        if self.ignored.matches(path, is_dir) {
            return None;
        }
        if !readable(path, is_dir) {
            warn!(path = %path.display(), "Unreadable, skipping");
            return None;
        }
        if (link_meta.file_type().is_symlink() || path_changes_on_resolve(path)) && !self.symlink_allowed(path) {
            warn!(path = %path.display(), "Symlink points outside the source root, skipping");
            return None;
        }
        if !meta.is_file() && !is_dir {
            debug!(path = %path.display(), "Special file, skipping");
            return None;
        }
        if is_dir {
            return Some(meta);
        }

        if let Some(registry) = &self.versioned_only {
            if !registry.has_history(path) {
                debug!(path = %path.display(), "No history, skipping");
                return None;
            }
        }
        Some(meta)
    }

    /// Reject a directory that resolves to `parent` or one of its ancestors.
    pub fn accept_child(&self, parent: &Path, path: &Path) -> bool {
        let (Ok(parent), Ok(child)) = (std::fs::canonicalize(parent), std::fs::canonicalize(path)) else {
            return false;
        };
        if parent.ancestors().any(|a| a == child) {
            warn!(path = %path.display(), target = %child.display(), "Symlink loop, skipping");
            return false;
        }
        true
    }

    fn symlink_allowed(&self, path: &Path) -> bool {
        let Ok(target) = std::fs::canonicalize(path) else {
            return false;
        };
        if target.starts_with(&self.local_root) {
            return true;
        }
        self.allowed_symlinks.iter().any(|(link, link_target)| {
            match (path.strip_prefix(link), target.strip_prefix(link_target)) {
                (Ok(suffix), Ok(target_suffix)) => suffix == target_suffix,
                _ => false,
            }
        })
    }
}

fn readable(path: &Path, is_dir: bool) -> bool {
    if is_dir {
        std::fs::read_dir(path).is_ok()
    } else {
        std::fs::File::open(path).is_ok()
    }
}

/// True when a parent component is a symlink.
fn path_changes_on_resolve(path: &Path) -> bool {
    std::fs::canonicalize(path).is_ok_and(|c| c != path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::catalog_detector;

    struct Tree {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        outside: PathBuf,
    }

    fn tree() -> Tree {
        let tmp = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(tmp.path()).unwrap();
        let root = base.join("src");
        let outside = base.join("outside");
        std::fs::create_dir_all(root.join("proj/lib")).unwrap();
        std::fs::create_dir_all(outside.join("shared")).unwrap();
        std::fs::write(root.join("proj/main.c"), "int main;").unwrap();
        std::fs::write(root.join("proj/notes.txt"), "notes").unwrap();
        std::fs::write(outside.join("shared/util.c"), "int util;").unwrap();
        Tree { _tmp: tmp, root, outside }
    }

    fn filter(config: Config) -> AcceptFilter {
        let config = Arc::new(config);
        let registry = Arc::new(RepositoryRegistry::with_parts(config.clone(), None, catalog_detector(Vec::new())));
        AcceptFilter::new(&config, None, registry).unwrap()
    }

    fn config(root: &Path) -> Config {
        Config {
            source_root: root.to_path_buf(),
            history_enabled: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_included_names_apply_to_files_only() {
        let t = tree();
        let f = filter(Config {
            included_names: vec!["*.c".to_string()],
            ..config(&t.root)
        });
        assert!(f.accept(&t.root.join("proj/main.c")).is_some());
        assert!(f.accept(&t.root.join("proj/notes.txt")).is_none());
        assert!(f.accept(&t.root.join("proj/lib")).is_some());
    }

    #[test]
    fn test_ignored_names() {
        let t = tree();
        std::fs::create_dir_all(t.root.join("proj/.git")).unwrap();
        let f = filter(Config {
            ignored_names: vec!["f:*.txt".to_string(), "d:lib".to_string()],
            ..config(&t.root)
        });
        assert!(f.accept(&t.root.join("proj/notes.txt")).is_none());
        assert!(f.accept(&t.root.join("proj/lib")).is_none());
        assert!(f.accept(&t.root.join("proj/.git")).is_none());
        assert!(f.accept(&t.root.join("proj/main.c")).is_some());
    }

    #[test]
    fn test_missing_entry_rejected() {
        let t = tree();
        let f = filter(config(&t.root));
        assert!(f.accept(&t.root.join("proj/gone.c")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks() {
        let t = tree();
        let local = t.root.join("proj/local.c");
        let escaping = t.root.join("proj/escape");
        let dangling = t.root.join("proj/dangling.c");
        std::os::unix::fs::symlink(t.root.join("proj/main.c"), &local).unwrap();
        std::os::unix::fs::symlink(t.outside.join("shared"), &escaping).unwrap();
        std::os::unix::fs::symlink(t.root.join("proj/nothing.c"), &dangling).unwrap();

        let f = filter(config(&t.root));
        assert!(f.accept(&local).is_some());
        assert!(f.accept(&escaping).is_none());
        assert!(f.accept(&escaping.join("util.c")).is_none());
        assert!(f.accept(&dangling).is_none());

        let allowed = filter(Config {
            allowed_symlinks: vec![escaping.clone()],
            ..config(&t.root)
        });
        assert!(allowed.accept(&escaping).is_some());
        assert!(allowed.accept(&escaping.join("util.c")).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_rejected() {
        let t = tree();
        let parent = t.root.join("proj/lib");
        let back = parent.join("up");
        std::os::unix::fs::symlink(t.root.join("proj"), &back).unwrap();
        let f = filter(config(&t.root));
        assert!(f.accept(&back).is_some());
        assert!(!f.accept_child(&parent, &back));
        assert!(f.accept_child(&t.root.join("proj"), &parent));
    }

    #[test]
    fn test_project_root_bounds_symlinks() {
        let t = tree();
        std::fs::create_dir_all(t.root.join("other")).unwrap();
        let config = Arc::new(config(&t.root));
        let registry = Arc::new(RepositoryRegistry::with_parts(config.clone(), None, catalog_detector(Vec::new())));
        let project = Project { name: "proj".into(), path: "/proj".into() };
        let f = AcceptFilter::new(&config, Some(&project), registry).unwrap();
        assert!(f.symlink_allowed(&t.root.join("proj/main.c")));
        assert!(!f.symlink_allowed(&t.root.join("other")));
    }
}
