//! Name-based include/ignore filters.
//!
//! Patterns are gitignore-style globs matched against a single path
//! component. A `f:` prefix restricts a pattern to files, `d:` to
//! directories; unprefixed patterns apply to both.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::SyncError;
use crate::vcs::{metadata_dir_names, SKIP_HISTORY_MARKER};

const FILE_PREFIX: &str = "f:";
const DIR_PREFIX: &str = "d:";

#[derive(Clone, Debug)]
pub struct NameFilter {
    files: Gitignore,
    dirs: Gitignore,
    patterns: usize,
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl NameFilter {
    /// Filter that matches nothing.
    pub fn empty() -> Self {
        Self {
            files: Gitignore::empty(),
            dirs: Gitignore::empty(),
            patterns: 0,
        }
    }

    pub fn new<I, S>(patterns: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut files = GitignoreBuilder::new("");
        let mut dirs = GitignoreBuilder::new("");
        let mut count = 0;

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let (to_files, to_dirs, glob) = if let Some(glob) = pattern.strip_prefix(FILE_PREFIX) {
                (true, false, glob)
            } else if let Some(glob) = pattern.strip_prefix(DIR_PREFIX) {
                (false, true, glob)
            } else {
                (true, true, pattern)
            };
            globset::Glob::new(glob).map_err(|e| invalid_pattern(pattern, e))?;
            if to_files {
                files.add_line(None, glob).map_err(|e| invalid_pattern(pattern, e))?;
            }
            if to_dirs {
                dirs.add_line(None, glob).map_err(|e| invalid_pattern(pattern, e))?;
            }
            count += 1;
        }

        Ok(Self {
            files: files.build().map_err(|e| invalid_pattern("<all>", e))?,
            dirs: dirs.build().map_err(|e| invalid_pattern("<all>", e))?,
            patterns: count,
        })
    }

    /// Configured ignore patterns plus backend metadata directories and the
    /// history skip marker.
    pub fn ignored<I, S>(patterns: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let builtin = metadata_dir_names()
            .map(|d| format!("{}{}", DIR_PREFIX, d))
            .chain(std::iter::once(format!("{}{}", FILE_PREFIX, SKIP_HISTORY_MARKER)));
        let configured: Vec<String> = patterns.into_iter().map(|p| p.as_ref().to_string()).collect();
        Self::new(builtin.chain(configured))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns == 0
    }

    /// Whether the last component of `path` matches.
    pub fn matches(&self, path: &Path, is_dir: bool) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let matcher = if is_dir { &self.dirs } else { &self.files };
        matcher.matched(Path::new(name), is_dir).is_ignore()
    }

    pub fn matches_file(&self, path: &Path) -> bool {
        self.matches(path, false)
    }

    pub fn matches_dir(&self, path: &Path) -> bool {
        self.matches(path, true)
    }
}

fn invalid_pattern(pattern: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Config {
        path: "ignored_names".to_string(),
        message: format!("invalid pattern '{}': {}", pattern, e),
    }
}
