//! Mercurial backend: drives the `hg` CLI with a fixed log template.
//!
//! Revisions are reported as `<rev>:<short node>` so that local revision
//! numbers order naturally. Incremental fetches query `tip:<rev>` and verify
//! that the boundary changeset comes back as the oldest entry.

use std::path::Path;
use std::sync::{LazyLock, RwLock};

use regex::Regex;

use super::command::CommandExecutor;
use super::{boundary_error, repo_relative, Repository, RepositoryDescriptor};
use crate::error::SyncError;
use crate::history::{format_timestamp, Annotation, History, HistoryEntry, TagEntry, TagList};

const FIELD_SEP: &str = "␞";
const COMMIT_PREFIX: &str = "COMMIT:";
const FILE_PREFIX: &str = "FILE:";

/// One header line per changeset, then one `FILE:` line per changed path.
const LOG_TEMPLATE: &str =
    "COMMIT:{rev}:{node|short}␞{date|hgdate}␞{author}␞{desc|firstline}\n{files % 'FILE:{file}\n'}";

/// `hg annotate -u -n -c` line: `<user> <rev> <node>: <content>`.
static ANNOTATE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<author>.*?\S)\s+(?P<rev>\d+)\s+(?P<node>[0-9a-f]{12}):").expect("Invalid regex")
});

/// `hg tags` line: `<name>   <rev>:<node>`.
static TAG_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<name>.+?)\s+(?P<rev>\d+):(?P<node>[0-9a-f]+)").expect("Invalid regex"));

#[derive(Debug)]
pub struct MercurialRepository {
    descriptor: RepositoryDescriptor,
    exec: CommandExecutor,
    tags: RwLock<Option<TagList>>,
}

impl MercurialRepository {
    pub fn new(descriptor: RepositoryDescriptor, exec: CommandExecutor) -> Self {
        Self {
            descriptor,
            exec: exec.env("HGPLAIN", "1"),
            tags: RwLock::new(None),
        }
    }

    fn hg(&self, args: &[&str]) -> Result<String, SyncError> {
        self.exec.run(self.root(), args)
    }

    fn log(&self, path: &Path, range: Option<&str>) -> Result<History, SyncError> {
        let rel = repo_relative(self.root(), path);
        let mut args = vec!["log", "--template", LOG_TEMPLATE];
        if let Some(range) = range {
            args.push("-r");
            args.push(range);
        }
        if !rel.is_empty() {
            args.push(&rel);
        }
        Ok(parse_hg_log(&self.hg(&args)?))
    }

    fn default_path(&self) -> Result<Option<String>, SyncError> {
        match self.hg(&["paths", "default"]) {
            Ok(out) => Ok(Some(out.trim().to_string()).filter(|s| !s.is_empty())),
            // exits 1 when no default path is configured
            Err(SyncError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Repository for MercurialRepository {
    fn descriptor(&self) -> &RepositoryDescriptor {
        &self.descriptor
    }

    fn history(&self, path: &Path) -> Result<History, SyncError> {
        self.log(path, None)
    }

    fn history_since(&self, path: &Path, since: &str) -> Result<History, SyncError> {
        let rev_num = since.split(':').next().unwrap_or(since);
        let mut history = self
            .log(path, Some(&format!("tip:{}", rev_num)))
            .map_err(|e| boundary_error(e, self.root(), since))?;
        history.remove_and_verify_oldest(since, self.root())?;
        Ok(history)
    }

    fn annotate(&self, path: &Path, revision: Option<&str>) -> Result<Annotation, SyncError> {
        let rel = repo_relative(self.root(), path);
        let rev_num = revision.map(|rev| self.revision_for_annotate(rev));
        let mut args = vec!["annotate", "-u", "-n", "-c"];
        if let Some(rev_num) = &rev_num {
            args.push("-r");
            args.push(rev_num);
        }
        args.push(&rel);
        Ok(parse_hg_annotate(&self.hg(&args)?, &rel))
    }

    fn update(&self) -> Result<(), SyncError> {
        if self.default_path()?.is_none() {
            return Err(SyncError::unsupported("hg", "update without a default path"));
        }
        self.hg(&["pull", "-u"]).map(|_| ())
    }

    fn determine_parent(&self) -> Result<Option<String>, SyncError> {
        self.default_path()
    }

    fn determine_branch(&self) -> Result<Option<String>, SyncError> {
        let out = self.hg(&["branch"])?;
        Ok(Some(out.trim().to_string()).filter(|s| !s.is_empty()))
    }

    fn determine_current_version(&self) -> Result<Option<String>, SyncError> {
        let history = parse_hg_log(&self.hg(&["log", "-l", "1", "--template", LOG_TEMPLATE])?);
        Ok(history.entries().first().map(|e| {
            format!("{} {} {} {}", format_timestamp(e.date), e.revision, e.author, e.message)
        }))
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
        let list = TagList::from_entries(parse_hg_tags(&self.hg(&["tags"])?), TagEntry::cmp);
        *self.tags.write()? = Some(list);
        Ok(())
    }

    fn tag_list(&self) -> Option<TagList> {
        self.tags.read().ok().and_then(|g| g.clone())
    }

    /// `<rev>:<node>` → `<rev>`.
    fn revision_for_annotate(&self, revision: &str) -> String {
        revision.split(':').next().unwrap_or(revision).to_string()
    }

    fn ignored_dirs(&self) -> &'static [&'static str] {
        &[".hg"]
    }

    fn ignored_files(&self) -> &'static [&'static str] {
        &[".hgtags", ".hgignore"]
    }
}

// ─── Parsers ────────────────────────────────────────────────────────

pub(crate) fn parse_hg_log(output: &str) -> History {
    let mut entries: Vec<HistoryEntry> = Vec::new();
    let mut current: Option<usize> = None;

    for line in output.lines() {
        if let Some(header) = line.strip_prefix(COMMIT_PREFIX) {
            let fields: Vec<&str> = header.split(FIELD_SEP).collect();
            if fields.len() < 4 {
                current = None;
                continue;
            }
            // hgdate is "<unix seconds> <offset>"
            let date = fields[1]
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let message = fields[3..].join(FIELD_SEP);
            entries.push(HistoryEntry::new(fields[0].trim(), fields[2].trim(), date, message.trim()));
            current = Some(entries.len() - 1);
        } else if let Some(file) = line.strip_prefix(FILE_PREFIX) {
            if let Some(idx) = current {
                entries[idx].add_file(file.trim());
            }
        }
    }
    History::new(entries)
}

pub(crate) fn parse_hg_annotate(output: &str, file_name: &str) -> Annotation {
    let mut annotation = Annotation::new(file_name);
    for line in output.lines() {
        if let Some(caps) = ANNOTATE_LINE.captures(line) {
            let revision = format!("{}:{}", &caps["rev"], &caps["node"]);
            annotation.add_line(revision, &caps["author"], true);
        }
    }
    annotation
}

fn parse_hg_tags(output: &str) -> Vec<TagEntry> {
    output
        .lines()
        .filter_map(|line| TAG_LINE.captures(line))
        .filter(|caps| &caps["name"] != "tip")
        .map(|caps| {
            let node = &caps["node"];
            let revision = format!("{}:{}", &caps["rev"], &node[..node.len().min(12)]);
            TagEntry::new(revision, 0, caps["name"].trim())
        })
        .collect()
}
