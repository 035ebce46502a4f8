//! Git backend: drives the `git` CLI.
//!
//! History comes from `git log --name-only --no-renames` with a
//! `COMMIT:`-prefixed, `␞`-separated header per commit followed by the
//! changed paths. Incremental fetches use the native `<since>..HEAD` range.
//! Tags only mark the tagged commit, so the tag list is pre-built and
//! inherited onto older commits by date.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::RwLock;

use tracing::warn;

use super::command::CommandExecutor;
use super::{boundary_error, repo_relative, Repository, RepositoryDescriptor};
use crate::error::SyncError;
use crate::history::{format_timestamp, Annotation, History, HistoryEntry, TagEntry, TagList};

// ─── Constants ──────────────────────────────────────────────────────

/// Field separator in git log format, U+241E (SYMBOL FOR RECORD SEPARATOR).
/// Never appears in commit data.
const FIELD_SEP: &str = "␞";

/// Commit line prefix in git log output.
const COMMIT_PREFIX: &str = "COMMIT:";

fn log_format() -> String {
    format!(
        "--format={}%H{}%ct{}%aE{}%aN{}%s",
        COMMIT_PREFIX, FIELD_SEP, FIELD_SEP, FIELD_SEP, FIELD_SEP
    )
}

// ─── Repository ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct GitRepository {
    descriptor: RepositoryDescriptor,
    exec: CommandExecutor,
    tags: RwLock<Option<TagList>>,
}

impl GitRepository {
    pub fn new(descriptor: RepositoryDescriptor, exec: CommandExecutor) -> Self {
        // keep git from walking above the working copy into an enclosing repo
        let exec = match descriptor.path.parent() {
            Some(parent) => exec.env("GIT_CEILING_DIRECTORIES", parent.display().to_string()),
            None => exec,
        };
        Self {
            descriptor,
            exec,
            tags: RwLock::new(None),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String, SyncError> {
        self.exec.run(self.root(), args)
    }

    fn log(&self, path: &Path, range: Option<&str>) -> Result<History, SyncError> {
        let rel = repo_relative(self.root(), path);
        let format = log_format();
        let mut args = vec!["-c", "core.quotePath=false", "log", "--name-only", "--no-renames", format.as_str()];
        if let Some(range) = range {
            args.push(range);
        }
        if !rel.is_empty() {
            args.push("--");
            args.push(&rel);
        }
        let output = self.git(&args)?;
        parse_git_log(output.as_bytes())
    }

    fn origin_url(&self) -> Result<Option<String>, SyncError> {
        match self.git(&["config", "--get", "remote.origin.url"]) {
            Ok(out) => Ok(Some(out.trim().to_string()).filter(|s| !s.is_empty())),
            // `git config --get` exits 1 when the key is missing
            Err(SyncError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Repository for GitRepository {
    fn descriptor(&self) -> &RepositoryDescriptor {
        &self.descriptor
    }

    fn history(&self, path: &Path) -> Result<History, SyncError> {
        self.log(path, None)
    }

    fn history_since(&self, path: &Path, since: &str) -> Result<History, SyncError> {
        self.log(path, Some(&format!("{}..HEAD", since)))
            .map_err(|e| boundary_error(e, self.root(), since))
    }

    fn annotate(&self, path: &Path, revision: Option<&str>) -> Result<Annotation, SyncError> {
        let rel = repo_relative(self.root(), path);
        let mut args = vec!["blame", "--porcelain"];
        if let Some(rev) = revision {
            args.push(rev);
        }
        args.push("--");
        args.push(&rel);
        let output = self.git(&args)?;
        Ok(parse_blame_porcelain(&output, &rel))
    }

    fn update(&self) -> Result<(), SyncError> {
        if self.origin_url()?.is_none() {
            return Err(SyncError::unsupported("git", "update without a remote"));
        }
        self.git(&["pull", "--ff-only"]).map(|_| ())
    }

    fn determine_parent(&self) -> Result<Option<String>, SyncError> {
        self.origin_url()
    }

    fn determine_branch(&self) -> Result<Option<String>, SyncError> {
        let out = self.git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(Some(out.trim().to_string()).filter(|s| !s.is_empty()))
    }

    fn determine_current_version(&self) -> Result<Option<String>, SyncError> {
        let format = format!("--format=%ct{}%H{}%aN{}%s", FIELD_SEP, FIELD_SEP, FIELD_SEP);
        let out = self.git(&["log", "-1", &format])?;
        let fields: Vec<&str> = out.trim().split(FIELD_SEP).collect();
        if fields.len() < 4 {
            return Ok(None);
        }
        let date = fields[0].parse::<i64>().map(format_timestamp).unwrap_or_default();
        let short = &fields[1][..fields[1].len().min(8)];
        Ok(Some(format!("{} {} {} {}", date, short, fields[2], fields[3..].join(FIELD_SEP))))
    }

    fn determine_working(&self) -> bool {
        self.exec.is_available()
    }

    fn supports_sub_repositories(&self) -> bool {
        true
    }

    fn has_file_based_tags(&self) -> bool {
        true
    }

    fn build_tag_list(&self) -> Result<(), SyncError> {
        let format = format!("--format=%H{}%ct{}%D", FIELD_SEP, FIELD_SEP);
        let output = self.git(&["log", "--tags", "--simplify-by-decoration", &format])?;
        let list = TagList::from_entries(parse_tag_log(&output), tag_order);
        match self.tags.write() {
            Ok(mut guard) => *guard = Some(list),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn tag_list(&self) -> Option<TagList> {
        self.tags.read().ok().and_then(|g| g.clone())
    }

    /// Commits are compared by committer date; hashes carry no order.
    fn compare_tag(&self, tag: &TagEntry, entry: &HistoryEntry) -> Ordering {
        tag.date.cmp(&entry.date)
    }

    fn ignored_dirs(&self) -> &'static [&'static str] {
        &[".git"]
    }

    /// Worktrees and submodules carry `.git` as a file.
    fn ignored_files(&self) -> &'static [&'static str] {
        &[".git"]
    }
}

fn tag_order(a: &TagEntry, b: &TagEntry) -> Ordering {
    a.date.cmp(&b.date).then_with(|| a.revision.cmp(&b.revision))
}

// ─── Log parser ─────────────────────────────────────────────────────

/// Parse git log output line by line.
///
/// Expected format: `--format=COMMIT:%H␞%ct␞%aE␞%aN␞%s` with `--name-only`.
///
/// - Lines starting with `COMMIT:` are commit headers split by `␞`
/// - Subject is the last field, rejoined in case it contains the separator
/// - Non-empty lines after a header are file paths
/// - Malformed headers are skipped along with their file lines
pub fn parse_git_log(reader: impl BufRead) -> Result<History, SyncError> {
    let mut entries: Vec<HistoryEntry> = Vec::new();
    let mut current: Option<usize> = None;

    for line in reader.lines() {
        let line = line?;

        if let Some(header) = line.strip_prefix(COMMIT_PREFIX) {
            let fields: Vec<&str> = header.split(FIELD_SEP).collect();
            if fields.len() < 5 {
                let preview: String = line.chars().take(100).collect();
                warn!(fields = fields.len(), line = %preview, "Malformed git log header");
                current = None;
                continue;
            }
            let timestamp: i64 = match fields[1].trim().parse() {
                Ok(t) => t,
                Err(e) => {
                    warn!(timestamp = fields[1], error = %e, "Skipping commit with bad timestamp");
                    current = None;
                    continue;
                }
            };
            let author = format_author(fields[3].trim(), fields[2].trim());
            let subject = fields[4..].join(FIELD_SEP);
            entries.push(HistoryEntry::new(fields[0].trim(), author, timestamp, subject.trim()));
            current = Some(entries.len() - 1);
        } else {
            let file = line.trim();
            if file.is_empty() {
                continue;
            }
            if let Some(idx) = current {
                entries[idx].add_file(file);
            }
        }
    }

    Ok(History::new(entries))
}

fn format_author(name: &str, email: &str) -> String {
    if email.is_empty() {
        name.to_string()
    } else {
        format!("{} <{}>", name, email)
    }
}

/// Parse `%H␞%ct␞%D` lines into tag entries; decorations other than tags are ignored.
fn parse_tag_log(output: &str) -> Vec<TagEntry> {
    let mut out = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split(FIELD_SEP).collect();
        if fields.len() < 3 {
            continue;
        }
        let names: Vec<&str> = fields[2]
            .split(", ")
            .filter_map(|d| d.trim().strip_prefix("tag: "))
            .collect();
        if names.is_empty() {
            continue;
        }
        let date = fields[1].trim().parse().unwrap_or(0);
        out.push(TagEntry::new(fields[0].trim(), date, names.join(", ")));
    }
    out
}

// ─── Blame ──────────────────────────────────────────────────────────

/// Parse git blame --porcelain output into an [`Annotation`].
///
/// Porcelain format (first occurrence of a commit):
/// ```text
/// <hash> <orig_line> <final_line> [<num_lines>]
/// author <name>
/// author-mail <<email>>
/// ...
/// filename <current_file>
/// \t<content line>
/// ```
///
/// Subsequent occurrences of the same commit only have the hash line and
/// the content line, so author names are remembered per hash.
pub(crate) fn parse_blame_porcelain(output: &str, file_name: &str) -> Annotation {
    let mut annotation = Annotation::new(file_name);
    let mut authors: HashMap<String, String> = HashMap::new();
    let mut lines_iter = output.lines();

    while let Some(line) = lines_iter.next() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let hash = parts[0];
        if hash.len() != 40 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }

        let mut author: Option<String> = None;
        for header_line in lines_iter.by_ref() {
            if header_line.starts_with('\t') {
                break;
            }
            if let Some(val) = header_line.strip_prefix("author ") {
                author = Some(val.to_string());
            }
        }

        let author = match author {
            Some(a) => {
                authors.insert(hash.to_string(), a.clone());
                a
            }
            None => authors.get(hash).cloned().unwrap_or_default(),
        };
        // the all-zero hash marks uncommitted lines
        let enabled = !hash.bytes().all(|b| b == b'0');
        annotation.add_line(hash, author, enabled);
    }

    annotation
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "git_tests.rs"]
mod tests;
