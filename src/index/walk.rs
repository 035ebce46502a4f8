//! Lazy live-tree walk in UID order.
//!
//! Siblings are visited by `name + "\0"` for files and `name + "/"` for
//! directories, which is the byte order of their UIDs. Only one directory
//! listing per level is held in memory.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::accept::AcceptFilter;
use super::uid;

/// A regular file accepted for indexing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveFile {
    pub path: PathBuf,
    /// Source-root relative path with a leading `/`.
    pub rel: String,
    pub mtime_ms: u64,
    pub size: u64,
}

impl LiveFile {
    pub fn uid(&self) -> String {
        uid::encode(&self.rel, self.mtime_ms)
    }
}

struct Child {
    key: String,
    path: PathBuf,
    rel: String,
    is_dir: bool,
    mtime_ms: u64,
    size: u64,
}

pub struct SortedWalk<'a> {
    filter: &'a AcceptFilter,
    /// Pending siblings per level, sorted descending so `pop` yields the next.
    stack: Vec<Vec<Child>>,
}

impl<'a> SortedWalk<'a> {
    /// Walk `dir`, whose source-root relative path is `rel` (`""` for the root).
    pub fn new(filter: &'a AcceptFilter, dir: &Path, rel: &str) -> Self {
        let mut walk = Self {
            filter,
            stack: Vec::new(),
        };
        let rel = rel.trim_end_matches('/');
        walk.push_dir(dir, rel);
        walk
    }

    fn push_dir(&mut self, dir: &Path, rel: &str) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot list directory");
                return;
            }
        };
        let mut children = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Cannot read directory entry");
                    continue;
                }
            };
            let path = entry.path();
            // a lossy name could collide with a sibling's and break UID uniqueness
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => {
                    warn!(path = %path.display(), "Skipping name that is not valid UTF-8");
                    continue;
                }
            };
            let Some(meta) = self.filter.accept(&path) else {
                continue;
            };
            let is_dir = meta.is_dir();
            if is_dir && !self.filter.accept_child(dir, &path) {
                continue;
            }
            let key = if is_dir { format!("{}/", name) } else { format!("{}{}", name, uid::SEPARATOR) };
            children.push(Child {
                key,
                rel: format!("{}/{}", rel, name),
                path,
                is_dir,
                mtime_ms: uid::mtime_millis(&meta),
                size: meta.len(),
            });
        }
        children.sort_unstable_by(|a, b| b.key.cmp(&a.key));
        self.stack.push(children);
    }
}

impl Iterator for SortedWalk<'_> {
    type Item = LiveFile;

    fn next(&mut self) -> Option<LiveFile> {
        loop {
            let level = self.stack.last_mut()?;
            let Some(child) = level.pop() else {
                self.stack.pop();
                continue;
            };
            if child.is_dir {
                self.push_dir(&child.path, &child.rel);
                continue;
            }
            return Some(LiveFile {
                path: child.path,
                rel: child.rel,
                mtime_ms: child.mtime_ms,
                size: child.size,
            });
        }
    }
}
