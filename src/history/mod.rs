//! History data model shared by the backends, the cache and the registry.
//!
//! A [`History`] is always ordered most-recent-first. Revisions are opaque
//! strings; their ordering belongs to the backend that produced them (see
//! [`natural_cmp`] for the default).

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub mod cache;

// ─── Core types ─────────────────────────────────────────────────────

/// One changeset as reported by a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub revision: String,
    pub author: String,
    /// Unix timestamp (seconds since epoch).
    pub date: i64,
    pub message: String,
    /// Changed paths, repository-relative and `/`-separated. May be empty.
    pub files: Vec<String>,
    /// Comma-joined tag names, filled in by [`assign_tags`].
    pub tags: Option<String>,
}

impl HistoryEntry {
    pub fn new(revision: impl Into<String>, author: impl Into<String>, date: i64, message: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            author: author.into(),
            date,
            message: message.into(),
            files: Vec::new(),
            tags: None,
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Add a file unless it is already listed.
    pub fn add_file(&mut self, file: &str) {
        if !self.files.iter().any(|f| f == file) {
            self.files.push(file.to_string());
        }
    }
}

/// Ordered sequence of entries, most recent first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [HistoryEntry] {
        &mut self.entries
    }

    pub fn into_entries(self) -> Vec<HistoryEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent revision, if any.
    pub fn latest_revision(&self) -> Option<&str> {
        self.entries.first().map(|e| e.revision.as_str())
    }

    pub fn oldest(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn revisions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.revision.as_str())
    }

    /// Drop the per-entry file lists (callers that did not ask for them).
    pub fn strip_files(&mut self) {
        for entry in &mut self.entries {
            entry.files.clear();
        }
    }

    /// Remove the oldest entry and check that it is the `since` boundary.
    ///
    /// Backends without a native "strictly after" query fetch `tip..since`
    /// inclusive; the boundary itself must come back as the oldest entry,
    /// otherwise the cached revision no longer exists upstream.
    pub fn remove_and_verify_oldest(&mut self, since: &str, repo: &Path) -> Result<(), SyncError> {
        match self.entries.pop() {
            Some(oldest) if oldest.revision == since => Ok(()),
            _ => Err(SyncError::CacheInconsistency {
                repo: repo.display().to_string(),
                revision: since.to_string(),
            }),
        }
    }

    /// Keep only the entries strictly newer than `since`, given a full history.
    pub fn truncate_since(mut self, since: &str, repo: &Path) -> Result<History, SyncError> {
        match self.entries.iter().position(|e| e.revision == since) {
            Some(pos) => {
                self.entries.truncate(pos + 1);
                self.remove_and_verify_oldest(since, repo)?;
                Ok(self)
            }
            None => Err(SyncError::CacheInconsistency {
                repo: repo.display().to_string(),
                revision: since.to_string(),
            }),
        }
    }
}

impl FromIterator<HistoryEntry> for History {
    fn from_iter<T: IntoIterator<Item = HistoryEntry>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ─── Tags ───────────────────────────────────────────────────────────

/// A tag (or several tags sharing a revision) as recorded by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    pub revision: String,
    pub date: i64,
    /// Comma-joined tag names.
    pub tags: String,
}

impl TagEntry {
    pub fn new(revision: impl Into<String>, date: i64, tags: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            date,
            tags: tags.into(),
        }
    }
}

impl Ord for TagEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        natural_cmp(&self.revision, &other.revision).then(self.date.cmp(&other.date))
    }
}

impl PartialOrd for TagEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Tags of one repository, ascending in the backend's tag order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagList {
    entries: Vec<TagEntry>,
}

impl TagList {
    /// Build a sorted list. Entries with the same revision are merged into one.
    pub fn from_entries<F>(mut entries: Vec<TagEntry>, order: F) -> Self
    where
        F: Fn(&TagEntry, &TagEntry) -> Ordering,
    {
        entries.sort_by(&order);
        let mut merged: Vec<TagEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match merged.last_mut() {
                Some(last) if last.revision == entry.revision => {
                    last.tags = format!("{}, {}", last.tags, entry.tags);
                }
                _ => merged.push(entry),
            }
        }
        Self { entries: merged }
    }

    pub fn entries(&self) -> &[TagEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Attach tag names to history entries in one linear pass.
///
/// `history` runs newest to oldest and `tags` is walked from its highest
/// entry down. Each entry receives the names of the closest tag at or before
/// it: a tag that compares greater than the current entry is passed over,
/// while a tag that compares less or equal is held and reused for following
/// (older) entries until a lower tag takes over.
/// `cmp(tag, entry)` orders a tag against a history entry.
pub fn assign_tags<F>(history: &mut History, tags: &TagList, cmp: F)
where
    F: Fn(&TagEntry, &HistoryEntry) -> Ordering,
{
    let tags = tags.entries();
    let mut idx = tags.len();
    for entry in history.entries_mut() {
        while idx > 0 && cmp(&tags[idx - 1], entry) == Ordering::Greater {
            idx -= 1;
        }
        entry.tags = if idx > 0 { Some(tags[idx - 1].tags.clone()) } else { None };
    }
}

// ─── Annotation ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationLine {
    pub revision: String,
    pub author: String,
    /// False for lines the backend marks as not belonging to this file version.
    pub enabled: bool,
}

/// Per-line blame data for one file version.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Annotation {
    pub file_name: String,
    lines: Vec<AnnotationLine>,
    descriptions: HashMap<String, String>,
    file_versions: HashMap<String, usize>,
}

impl Annotation {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn add_line(&mut self, revision: impl Into<String>, author: impl Into<String>, enabled: bool) {
        self.lines.push(AnnotationLine {
            revision: revision.into(),
            author: author.into(),
            enabled,
        });
    }

    pub fn lines(&self) -> &[AnnotationLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Revision of a 1-based line number.
    pub fn revision_at(&self, line: usize) -> Option<&str> {
        line.checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(|l| l.revision.as_str())
    }

    pub fn author_at(&self, line: usize) -> Option<&str> {
        line.checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(|l| l.author.as_str())
    }

    /// Distinct revisions referenced by any line.
    pub fn revisions(&self) -> BTreeSet<&str> {
        self.lines.iter().map(|l| l.revision.as_str()).collect()
    }

    pub fn set_description(&mut self, revision: &str, description: String) {
        self.descriptions.insert(revision.to_string(), description);
    }

    pub fn description(&self, revision: &str) -> Option<&str> {
        self.descriptions.get(revision).map(String::as_str)
    }

    /// 1-based position of `revision` in the file's history, oldest = 1.
    pub fn set_file_version(&mut self, revision: &str, version: usize) {
        self.file_versions.insert(revision.to_string(), version);
    }

    pub fn file_version(&self, revision: &str) -> Option<usize> {
        self.file_versions.get(revision).copied()
    }

    /// Fill descriptions and file versions from the file's history.
    pub fn cross_reference(&mut self, history: &History) {
        let referenced: BTreeSet<String> = self.revisions().into_iter().map(str::to_string).collect();
        let total = history.len();
        for (i, entry) in history.entries().iter().enumerate() {
            if !referenced.contains(&entry.revision) {
                continue;
            }
            let mut description = format!(
                "changeset: {}\nuser: {}\ndate: {}\nsummary: {}",
                entry.revision,
                entry.author,
                format_timestamp(entry.date),
                entry.message
            );
            if let Some(tags) = &entry.tags {
                description.push_str(&format!("\ntags: {}", tags));
            }
            self.set_description(&entry.revision, description);
            self.set_file_version(&entry.revision, total - i);
        }
    }
}

// ─── Revision ordering ──────────────────────────────────────────────

/// Compare two strings treating embedded digit runs as numbers:
/// `"r9" < "r10"`, `"2:abc" < "12:abc"`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let db = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let na = trim_leading_zeros(&a[..da]);
                let nb = trim_leading_zeros(&b[..db]);
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_leading_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().position(|&c| c != b'0').unwrap_or(digits.len());
    &digits[start..]
}

// ─── Date helpers ───────────────────────────────────────────────────

/// Format a Unix timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_timestamp(timestamp: i64) -> String {
    let secs_per_day: i64 = 86400;
    let days = timestamp.div_euclid(secs_per_day);
    let time_of_day = timestamp.rem_euclid(secs_per_day);
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        y,
        m,
        d,
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60
    )
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let days_civil = days + 719468;
    let era = if days_civil >= 0 { days_civil } else { days_civil - 146096 } / 146097;
    let doe = (days_civil - era * 146097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe as i64 - 719468
}

/// Parse a timezone offset string like "+0300", "-0500", "+0545" into seconds.
/// Returns 0 for invalid/empty input.
pub fn parse_tz_offset(tz: &str) -> i64 {
    if tz.len() < 5 || !tz.is_ascii() {
        return 0;
    }
    let sign: i64 = if tz.starts_with('-') { -1 } else { 1 };
    let hours: i64 = tz[1..3].parse().unwrap_or(0);
    let minutes: i64 = tz[3..5].parse().unwrap_or(0);
    sign * (hours * 3600 + minutes * 60)
}

/// Parse `YYYY-MM-DD HH:MM:SS [+ZZZZ]` into a Unix timestamp.
pub fn parse_datetime(s: &str) -> Option<i64> {
    let mut parts = s.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let offset = parts.next().map(parse_tz_offset).unwrap_or(0);

    let mut ymd = date.split('-').map(|p| p.parse::<i64>().ok());
    let (y, m, d) = (ymd.next()??, ymd.next()??, ymd.next()??);
    let mut hms = time.split(':').map(|p| p.parse::<i64>().ok());
    let (h, mi, sec) = (hms.next()??, hms.next()??, hms.next().flatten().unwrap_or(0));
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    let days = days_from_civil(y, m as u32, d as u32);
    Some(days * 86400 + h * 3600 + mi * 60 + sec - offset)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
