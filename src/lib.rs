//! # reposync: repository discovery, history caching and index synchronization
//!
//! The engine behind a code-search indexer:
//!
//! - [`registry`] discovers version-control repositories under a source tree,
//!   maps any path to the repository that owns it, and populates the history
//!   cache with bounded concurrency.
//! - [`history`] holds the history data model and the persistent
//!   [`history::cache::HistoryCache`].
//! - [`vcs`] is the backend contract ([`vcs::Repository`]) with Git, Mercurial
//!   and Subversion implementations driven through external commands.
//! - [`index`] keeps a full-text index consistent with the live file tree
//!   using a single-pass sorted merge over document UIDs.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod error;
pub mod history;
pub mod index;
pub mod names;
pub mod registry;
pub mod storage;
pub mod vcs;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use error::SyncError;

/// Default minimum token length used for indexing and search.
/// Tokens shorter than this are discarded during tokenization.
pub const DEFAULT_MIN_TOKEN_LEN: usize = 2;

// ─── Stable hashing ─────────────────────────────────────────────────

/// Stable FNV-1a hash (deterministic across Rust versions, unlike `DefaultHasher`).
///
/// Accepts multiple byte slices that are fed into the hash sequentially.
#[must_use]
pub fn stable_hash(parts: &[&[u8]]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;
    let mut hash = FNV_OFFSET;
    for part in parts {
        for &byte in *part {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

// ─── Path helpers ───────────────────────────────────────────────────

/// Strip the `\\?\` extended-length path prefix that Windows canonicalize adds.
#[must_use]
pub fn clean_path(p: &str) -> String {
    p.strip_prefix(r"\\?\").unwrap_or(p).to_string()
}

/// Readable file-name prefix for per-root data files: the last path component,
/// restricted to `[A-Za-z0-9_-]` and at most 32 chars. `"root"` when empty.
#[must_use]
pub fn semantic_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned
    }
}

/// Convert a path to the `/`-separated form used for UIDs and cache keys.
#[must_use]
pub fn to_slash(path: &Path) -> String {
    clean_path(&path.to_string_lossy()).replace('\\', "/")
}

/// Seconds since the Unix epoch (0 if the clock is before 1970).
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(std::time::Duration::ZERO)
        .as_secs()
}

/// Tokenize a line of text into lowercase tokens.
///
/// Splits on non-alphanumeric characters (except `_`),
/// filters by minimum length, and lowercases all tokens.
///
/// # Examples
///
/// ```
/// use reposync::tokenize;
///
/// let tokens = tokenize("fn history_since(path: &Path)", 2);
/// assert!(tokens.contains(&"fn".to_string()));
/// assert!(tokens.contains(&"history_since".to_string()));
/// assert!(tokens.contains(&"path".to_string()));
/// ```
#[must_use]
pub fn tokenize(line: &str, min_len: usize) -> Vec<String> {
    line.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.len() >= min_len)
        .map(|s| s.to_lowercase())
        .collect()
}
