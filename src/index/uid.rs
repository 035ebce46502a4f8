//! Document UIDs: `<path>\0<mtime millis, 20 digits>`.
//!
//! Paths are source-root relative with a leading `/`. The NUL separator sorts
//! below every path byte, so byte order of UIDs is path order first and
//! modification time second. Sibling files therefore have to be visited in
//! `name + "\0"` order and directories in `name + "/"` order for a walk to
//! produce UIDs in ascending order (see [`super::walk`]).

use std::fs::Metadata;
use std::time::UNIX_EPOCH;

pub const SEPARATOR: char = '\0';

/// Width of the zero-padded timestamp.
const MTIME_DIGITS: usize = 20;

pub fn encode(rel_path: &str, mtime_ms: u64) -> String {
    format!("{}{}{:0width$}", rel_path, SEPARATOR, mtime_ms, width = MTIME_DIGITS)
}

/// Split a UID into its path and timestamp.
pub fn decode(uid: &str) -> Option<(&str, u64)> {
    let (path, mtime) = uid.rsplit_once(SEPARATOR)?;
    if mtime.len() != MTIME_DIGITS {
        return None;
    }
    Some((path, mtime.parse().ok()?))
}

/// Path part of a UID. A malformed UID is returned whole.
pub fn path_of(uid: &str) -> &str {
    uid.split_once(SEPARATOR).map_or(uid, |(path, _)| path)
}

/// UID prefix covering every document under `dir_rel`
/// (`""` or `"/"` for the whole source root).
pub fn subtree_prefix(dir_rel: &str) -> String {
    let trimmed = dir_rel.trim_end_matches('/');
    format!("{}/", trimmed)
}

/// Modification time in milliseconds since the epoch (0 when unavailable).
pub fn mtime_millis(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
