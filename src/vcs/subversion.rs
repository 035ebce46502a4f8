//! Subversion backend: drives the `svn` CLI.
//!
//! `svn log -v` reports changed paths relative to the repository root
//! (`/trunk/src/main.c`); they are rewritten relative to the working copy
//! using the path recorded by `svn info`. Incremental fetches query
//! `BASE:<rev>` and verify the boundary entry.

use std::path::Path;
use std::sync::{LazyLock, OnceLock};

use regex::Regex;
use tracing::debug;

use super::command::CommandExecutor;
use super::{boundary_error, repo_relative, Repository, RepositoryDescriptor};
use crate::error::SyncError;
use crate::history::{format_timestamp, parse_datetime, Annotation, History, HistoryEntry};

const SEPARATOR: &str = "------------------------------------------------------------------------";

/// `r12 | alice | 2023-01-01 10:00:00 +0100 (Sun, 01 Jan 2023) | 2 lines`
static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^r(?P<rev>\d+) \| (?P<author>[^|]*) \| (?P<date>[^(|]*?)\s*(\([^)]*\))? \| (?P<lines>\d+) lines?$")
        .expect("Invalid regex")
});

/// `   M /trunk/src/main.c (from /trunk/src/old.c:11)`
static CHANGED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+[AMDR] (?P<path>.+?)(?: \(from .+:\d+\))?$").expect("Invalid regex"));

/// `svn blame` line: `<rev> <author> <content>`; uncommitted lines show `-`.
static BLAME_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?P<rev>\d+|-)\s+(?P<author>\S+)").expect("Invalid regex"));

/// Fields of `svn info` that the backend uses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SvnInfo {
    pub url: String,
    pub root_url: String,
    /// Working copy location inside the repository, e.g. `/trunk`.
    pub repos_path: String,
}

#[derive(Debug)]
pub struct SubversionRepository {
    descriptor: RepositoryDescriptor,
    exec: CommandExecutor,
    info: OnceLock<SvnInfo>,
}

impl SubversionRepository {
    pub fn new(descriptor: RepositoryDescriptor, exec: CommandExecutor) -> Self {
        Self {
            descriptor,
            exec,
            info: OnceLock::new(),
        }
    }

    fn svn(&self, args: &[&str]) -> Result<String, SyncError> {
        self.exec.run(self.root(), args)
    }

    fn info(&self) -> Result<&SvnInfo, SyncError> {
        if let Some(info) = self.info.get() {
            return Ok(info);
        }
        let parsed = parse_svn_info(&self.svn(&["info", "--non-interactive"])?);
        Ok(self.info.get_or_init(|| parsed))
    }

    fn log(&self, path: &Path, range: Option<&str>, limit: Option<&str>) -> Result<History, SyncError> {
        let repos_path = self.info()?.repos_path.clone();
        let rel = repo_relative(self.root(), path);
        let target = if rel.is_empty() { ".".to_string() } else { rel };
        let mut args = vec!["log", "--non-interactive", "-v"];
        if let Some(range) = range {
            args.push("-r");
            args.push(range);
        }
        if let Some(limit) = limit {
            args.push("-l");
            args.push(limit);
        }
        args.push(&target);
        Ok(parse_svn_log(&self.svn(&args)?, &repos_path))
    }
}

impl Repository for SubversionRepository {
    fn descriptor(&self) -> &RepositoryDescriptor {
        &self.descriptor
    }

    fn history(&self, path: &Path) -> Result<History, SyncError> {
        self.log(path, None, None)
    }

    fn history_since(&self, path: &Path, since: &str) -> Result<History, SyncError> {
        let mut history = self
            .log(path, Some(&format!("BASE:{}", since)), None)
            .map_err(|e| boundary_error(e, self.root(), since))?;
        history.remove_and_verify_oldest(since, self.root())?;
        Ok(history)
    }

    fn annotate(&self, path: &Path, revision: Option<&str>) -> Result<Annotation, SyncError> {
        let rel = repo_relative(self.root(), path);
        let mut args = vec!["blame", "--non-interactive"];
        if let Some(rev) = revision {
            args.push("-r");
            args.push(rev);
        }
        args.push(&rel);
        Ok(parse_svn_blame(&self.svn(&args)?, &rel))
    }

    fn update(&self) -> Result<(), SyncError> {
        self.svn(&["update", "--non-interactive"]).map(|_| ())
    }

    fn determine_parent(&self) -> Result<Option<String>, SyncError> {
        Ok(Some(self.info()?.url.clone()).filter(|s| !s.is_empty()))
    }

    fn determine_branch(&self) -> Result<Option<String>, SyncError> {
        Ok(branch_from_repos_path(&self.info()?.repos_path))
    }

    fn determine_current_version(&self) -> Result<Option<String>, SyncError> {
        let history = self.log(self.root(), None, Some("1"))?;
        Ok(history.entries().first().map(|e| {
            format!("{} r{} {} {}", format_timestamp(e.date), e.revision, e.author, e.message)
        }))
    }

    fn determine_remote(&self) -> Result<bool, SyncError> {
        let info = self.info()?;
        Ok(!info.url.is_empty() && !info.url.starts_with("file:"))
    }

    fn determine_working(&self) -> bool {
        self.exec.is_available()
    }

    fn ignored_dirs(&self) -> &'static [&'static str] {
        &[".svn"]
    }
}

// ─── Parsers ────────────────────────────────────────────────────────

pub(crate) fn parse_svn_info(output: &str) -> SvnInfo {
    let mut info = SvnInfo::default();
    let mut relative_url: Option<String> = None;
    for line in output.lines() {
        if let Some(v) = line.strip_prefix("URL: ") {
            info.url = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("Repository Root: ") {
            info.root_url = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("Relative URL: ") {
            relative_url = Some(v.trim().trim_start_matches('^').to_string());
        }
    }
    info.repos_path = match relative_url {
        Some(rel) => rel,
        None => info
            .url
            .strip_prefix(&info.root_url)
            .map(str::to_string)
            .unwrap_or_default(),
    };
    info
}

/// `/trunk/...` → `trunk`, `/branches/<name>/...` → `<name>`.
fn branch_from_repos_path(repos_path: &str) -> Option<String> {
    let mut parts = repos_path.split('/').filter(|p| !p.is_empty());
    match parts.next()? {
        "trunk" => Some("trunk".to_string()),
        "branches" | "tags" => parts.next().map(str::to_string),
        _ => None,
    }
}

/// Parse plain `svn log -v` output. Changed paths are rewritten relative to
/// `repos_path`; paths outside the working copy are dropped.
pub(crate) fn parse_svn_log(output: &str, repos_path: &str) -> History {
    let prefix = format!("{}/", repos_path.trim_end_matches('/'));
    let mut entries: Vec<HistoryEntry> = Vec::new();
    let mut lines = output.lines().peekable();

    while let Some(line) = lines.next() {
        if line == SEPARATOR {
            continue;
        }
        let Some(caps) = HEADER_LINE.captures(line) else {
            continue;
        };
        let date = parse_datetime(caps["date"].trim()).unwrap_or(0);
        let msg_lines: usize = caps["lines"].parse().unwrap_or(0);
        let mut entry = HistoryEntry::new(&caps["rev"], caps["author"].trim(), date, String::new());

        // optional changed-paths block, terminated by a blank line
        if lines.peek().is_some_and(|l| l.starts_with("Changed paths:")) {
            lines.next();
            for path_line in lines.by_ref() {
                if path_line.trim().is_empty() {
                    break;
                }
                if let Some(pc) = CHANGED_PATH.captures(path_line) {
                    let path = &pc["path"];
                    if let Some(rel) = path.strip_prefix(&prefix) {
                        entry.add_file(rel);
                    } else {
                        debug!(path, "Changed path outside the working copy");
                    }
                }
            }
        } else if lines.peek().is_some_and(|l| l.trim().is_empty()) {
            lines.next();
        }

        let message: Vec<&str> = lines.by_ref().take(msg_lines).collect();
        entry.message = message.join("\n").trim().to_string();
        entries.push(entry);
    }
    History::new(entries)
}

pub(crate) fn parse_svn_blame(output: &str, file_name: &str) -> Annotation {
    let mut annotation = Annotation::new(file_name);
    for line in output.lines() {
        if let Some(caps) = BLAME_LINE.captures(line) {
            let rev = &caps["rev"];
            annotation.add_line(rev, &caps["author"], rev != "-");
        }
    }
    annotation
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
------------------------------------------------------------------------
r12 | alice | 2023-11-15 01:13:20 +0300 (Wed, 15 Nov 2023) | 1 line
Changed paths:
   M /trunk/src/main.c
   A /trunk/doc/guide.txt (from /trunk/doc/old.txt:11)
   M /branches/other/x.c

Fix the parser
------------------------------------------------------------------------
r11 | bob | 2023-11-14 10:00:00 +0000 (Tue, 14 Nov 2023) | 1 line
Changed paths:
   A /trunk/src/main.c

Initial import
------------------------------------------------------------------------
";

    #[test]
    fn test_parse_svn_log() {
        let h = parse_svn_log(LOG, "/trunk");
        assert_eq!(h.len(), 2);
        let first = &h.entries()[0];
        assert_eq!(first.revision, "12");
        assert_eq!(first.author, "alice");
        assert_eq!(first.date, 1700000000);
        assert_eq!(first.files, vec!["src/main.c", "doc/guide.txt"]);
        assert_eq!(first.message, "Fix the parser");
        assert_eq!(h.oldest().unwrap().message, "Initial import");
    }

    #[test]
    fn test_parse_svn_log_message_containing_separator() {
        let log = format!(
            "{sep}\nr3 | carol | 2023-11-14 10:00:00 +0000 (Tue, 14 Nov 2023) | 3 lines\n\nline one\n{sep}\nline three\n{sep}\n",
            sep = SEPARATOR
        );
        let h = parse_svn_log(&log, "/trunk");
        assert_eq!(h.len(), 1);
        assert!(h.entries()[0].message.ends_with("line three"));
    }

    #[test]
    fn test_parse_svn_info() {
        let out = "\
Path: .
Working Copy Root Path: /src/proj
URL: https://svn.example.com/repo/branches/feature-x
Relative URL: ^/branches/feature-x
Repository Root: https://svn.example.com/repo
Revision: 42
";
        let info = parse_svn_info(out);
        assert_eq!(info.repos_path, "/branches/feature-x");
        assert_eq!(info.root_url, "https://svn.example.com/repo");
        assert_eq!(branch_from_repos_path(&info.repos_path).as_deref(), Some("feature-x"));
    }

    #[test]
    fn test_parse_svn_info_without_relative_url() {
        let out = "URL: file:///var/svn/repo/trunk\nRepository Root: file:///var/svn/repo\n";
        let info = parse_svn_info(out);
        assert_eq!(info.repos_path, "/trunk");
        assert_eq!(branch_from_repos_path(&info.repos_path).as_deref(), Some("trunk"));
    }

    #[test]
    fn test_parse_svn_blame() {
        let out = "    11        bob int main() {\n    12      alice     return 0;\n     -          - local edit\n";
        let ann = parse_svn_blame(out, "main.c");
        assert_eq!(ann.len(), 3);
        assert_eq!(ann.revision_at(2), Some("12"));
        assert_eq!(ann.author_at(1), Some("bob"));
        assert!(!ann.lines()[2].enabled);
    }
}
