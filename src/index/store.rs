//! Ordered document store with an inverted token index.
//!
//! Documents are keyed by UID in a `BTreeMap`, so a [`TermCursor`] can walk
//! the UIDs under a path prefix in sorted order. Readers work on an `Arc`
//! snapshot; an [`IndexWriter`] buffers adds and deletes and publishes a new
//! snapshot on commit, after the data file has been replaced atomically.
//!
//! Directory layout:
//!
//! ```text
//! <index dir>/documents.bin   LZ4 + bincode StoreData
//! <index dir>/dirty           present while changes await optimization
//! <index dir>/indexed         unix time of the last complete pass
//! <index dir>/write.lock      exclusively locked while a writer is open
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::storage::{load_compressed, save_compressed};

/// Store format version. Bump when struct layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

const DOCUMENTS_FILE: &str = "documents.bin";
const DIRTY_FILE: &str = "dirty";
const INDEXED_FILE: &str = "indexed";
const LOCK_FILE: &str = "write.lock";

// ─── Stored data ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Source-root relative path with a leading `/`.
    pub path: String,
    pub mtime_ms: u64,
    pub size: u64,
    pub project: Option<String>,
    /// Name of the analyzer that produced the fields.
    pub analyzer: String,
    pub token_count: usize,
    /// Distinct tokens of the document, used to unlink its postings.
    pub terms: Vec<String>,
}

/// token → uid → line numbers (1-based)
pub type Postings = HashMap<String, BTreeMap<String, Vec<u32>>>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub format_version: u32,
    pub documents: BTreeMap<String, Document>,
    pub postings: Postings,
}

impl StoreData {
    fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            ..Default::default()
        }
    }

    fn insert(&mut self, uid: String, doc: Document, fields: HashMap<String, Vec<u32>>) {
        if self.documents.contains_key(&uid) {
            self.remove(&uid);
        }
        for (token, lines) in fields {
            self.postings.entry(token).or_default().insert(uid.clone(), lines);
        }
        self.documents.insert(uid, doc);
    }

    /// Posting lists emptied here are dropped later by [`StoreData::compact`].
    fn remove(&mut self, uid: &str) -> Option<Document> {
        let doc = self.documents.remove(uid)?;
        for term in &doc.terms {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(uid);
            }
        }
        Some(doc)
    }

    /// Drop empty posting lists and postings of unknown documents.
    fn compact(&mut self) -> usize {
        let before = self.postings.len();
        let documents = &self.documents;
        for list in self.postings.values_mut() {
            list.retain(|uid, _| documents.contains_key(uid));
        }
        self.postings.retain(|_, list| !list.is_empty());
        self.postings.shrink_to_fit();
        before - self.postings.len()
    }

    /// Tokens found in at least `min_docs` documents, with their document
    /// counts, in token order.
    pub fn document_frequencies(&self, min_docs: usize) -> Vec<(&str, usize)> {
        let min_docs = min_docs.max(1);
        let mut tokens: Vec<(&str, usize)> = self
            .postings
            .iter()
            .map(|(token, list)| (token.as_str(), list.len()))
            .filter(|&(_, docs)| docs >= min_docs)
            .collect();
        tokens.sort_unstable();
        tokens
    }

    /// Documents containing `token`, as `(path, lines)` sorted by path.
    pub fn search(&self, token: &str) -> Vec<(&str, &[u32])> {
        let Some(list) = self.postings.get(token) else {
            return Vec::new();
        };
        list.iter()
            .filter_map(|(uid, lines)| self.documents.get(uid).map(|d| (d.path.as_str(), lines.as_slice())))
            .collect()
    }
}

// ─── Store ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DocumentStore {
    dir: PathBuf,
    data: RwLock<Arc<StoreData>>,
}

impl DocumentStore {
    /// Open the store in `dir`. A missing data file is an empty store; a
    /// data file from another format version is discarded.
    pub fn open(dir: &Path) -> Result<Self, SyncError> {
        let file = dir.join(DOCUMENTS_FILE);
        let data = if file.exists() {
            let data: StoreData = load_compressed(&file, "documents")?;
            if data.format_version == FORMAT_VERSION {
                data
            } else {
                warn!(
                    index = %dir.display(),
                    found = data.format_version,
                    expected = FORMAT_VERSION,
                    "Index format changed, starting empty"
                );
                StoreData::new()
            }
        } else {
            StoreData::new()
        };
        debug!(index = %dir.display(), documents = data.documents.len(), "Document store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            data: RwLock::new(Arc::new(data)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> Arc<StoreData> {
        match self.data.read() {
            Ok(data) => data.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn num_documents(&self) -> usize {
        self.snapshot().documents.len()
    }

    /// Cursor over the committed UIDs starting with `prefix`.
    pub fn cursor(&self, prefix: &str) -> TermCursor {
        TermCursor::new(self.snapshot(), prefix)
    }

    /// Open the single writer. Fails with `AlreadyRunning` while another
    /// writer, in this or another process, holds the lock. The lock dies
    /// with its holder, so a killed process leaves nothing to clean up.
    pub fn writer(&self) -> Result<IndexWriter<'_>, SyncError> {
        std::fs::create_dir_all(&self.dir)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;
        if let Err(e) = lock.try_lock_exclusive() {
            let contended = e.kind() == ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            if contended {
                return Err(SyncError::AlreadyRunning {
                    index: self.dir.display().to_string(),
                });
            }
            return Err(e.into());
        }
        let writer = IndexWriter {
            store: self,
            lock,
            ops: Vec::new(),
        };
        // make sure the data file exists before any change is buffered
        let file = self.dir.join(DOCUMENTS_FILE);
        if !file.exists() {
            save_compressed(&file, self.snapshot().as_ref(), "documents")?;
        }
        Ok(writer)
    }

    pub fn is_dirty(&self) -> bool {
        self.dir.join(DIRTY_FILE).exists()
    }

    pub fn set_dirty(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join(DIRTY_FILE), b"")?;
        Ok(())
    }

    pub fn clear_dirty(&self) -> Result<(), SyncError> {
        match std::fs::remove_file(self.dir.join(DIRTY_FILE)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Record that a complete pass finished now.
    pub fn mark_indexed(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join(INDEXED_FILE), crate::now_secs().to_string())?;
        Ok(())
    }

    /// Unix time of the last complete pass, if any.
    pub fn indexed_at(&self) -> Option<u64> {
        std::fs::read_to_string(self.dir.join(INDEXED_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Compact postings and rewrite the data file. Returns the number of
    /// dropped posting lists.
    pub fn compact(&self) -> Result<usize, SyncError> {
        let mut next = (*self.snapshot()).clone();
        let dropped = next.compact();
        save_compressed(&self.dir.join(DOCUMENTS_FILE), &next, "documents")?;
        self.publish(next)?;
        Ok(dropped)
    }

    fn publish(&self, data: StoreData) -> Result<(), SyncError> {
        *self.data.write()? = Arc::new(data);
        Ok(())
    }
}

// ─── Term cursor ────────────────────────────────────────────────────

/// Forward cursor over sorted UIDs sharing a prefix.
///
/// Holds its own snapshot, so commits made while it is open are not seen.
#[derive(Debug)]
pub struct TermCursor {
    data: Arc<StoreData>,
    prefix: String,
    current: Option<String>,
}

impl TermCursor {
    fn new(data: Arc<StoreData>, prefix: &str) -> Self {
        let current = Self::first_from(&data, prefix, Bound::Included(prefix));
        Self {
            data,
            prefix: prefix.to_string(),
            current,
        }
    }

    fn first_from(data: &StoreData, prefix: &str, from: Bound<&str>) -> Option<String> {
        data.documents
            .range::<str, _>((from, Bound::Unbounded))
            .next()
            .map(|(uid, _)| uid)
            .filter(|uid| uid.starts_with(prefix))
            .cloned()
    }

    /// Current UID, `None` once the prefix range is exhausted.
    pub fn peek(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn document(&self) -> Option<&Document> {
        self.current.as_ref().and_then(|uid| self.data.documents.get(uid))
    }

    pub fn advance(&mut self) {
        if let Some(current) = self.current.take() {
            self.current = Self::first_from(&self.data, &self.prefix, Bound::Excluded(current.as_str()));
        }
    }
}

impl Iterator for TermCursor {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let uid = self.current.clone()?;
        self.advance();
        Some(uid)
    }
}

// ─── Writer ─────────────────────────────────────────────────────────

enum Op {
    Add {
        uid: String,
        doc: Document,
        fields: HashMap<String, Vec<u32>>,
    },
    Delete(String),
}

/// Counts of a committed batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub added: usize,
    pub deleted: usize,
}

/// Exclusive writer. Changes stay invisible until [`IndexWriter::commit`];
/// dropping the writer releases the lock and discards uncommitted changes.
pub struct IndexWriter<'a> {
    store: &'a DocumentStore,
    lock: File,
    ops: Vec<Op>,
}

impl IndexWriter<'_> {
    pub fn add_document(&mut self, uid: String, doc: Document, fields: HashMap<String, Vec<u32>>) {
        self.ops.push(Op::Add { uid, doc, fields });
    }

    pub fn delete_document(&mut self, uid: &str) {
        self.ops.push(Op::Delete(uid.to_string()));
    }

    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Apply the buffered operations, persist atomically, publish the new
    /// snapshot. On error nothing is published and the batch is kept.
    pub fn commit(&mut self) -> Result<CommitStats, SyncError> {
        if self.ops.is_empty() {
            return Ok(CommitStats::default());
        }
        let mut next = (*self.store.snapshot()).clone();
        let mut stats = CommitStats::default();
        for op in &self.ops {
            match op {
                Op::Add { uid, doc, fields } => {
                    next.insert(uid.clone(), doc.clone(), fields.clone());
                    stats.added += 1;
                }
                Op::Delete(uid) => {
                    if next.remove(uid).is_some() {
                        stats.deleted += 1;
                    }
                }
            }
        }
        save_compressed(&self.store.dir.join(DOCUMENTS_FILE), &next, "documents")?;
        self.store.publish(next)?;
        self.ops.clear();
        info!(
            index = %self.store.dir.display(),
            added = stats.added,
            deleted = stats.deleted,
            "Index committed"
        );
        Ok(stats)
    }
}

impl Drop for IndexWriter<'_> {
    fn drop(&mut self) {
        if !self.ops.is_empty() {
            warn!(index = %self.store.dir.display(), pending = self.ops.len(), "Discarding uncommitted changes");
        }
        if let Err(e) = FileExt::unlock(&self.lock) {
            warn!(index = %self.store.dir.display(), error = %e, "Failed to release write lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::uid;

    fn doc(path: &str, mtime_ms: u64, terms: &[&str]) -> (String, Document, HashMap<String, Vec<u32>>) {
        let fields: HashMap<String, Vec<u32>> = terms.iter().map(|t| (t.to_string(), vec![1])).collect();
        let document = Document {
            path: path.to_string(),
            mtime_ms,
            size: 10,
            project: None,
            analyzer: "test".to_string(),
            token_count: terms.len(),
            terms: terms.iter().map(|t| t.to_string()).collect(),
        };
        (uid::encode(path, mtime_ms), document, fields)
    }

    fn add(writer: &mut IndexWriter<'_>, path: &str, mtime_ms: u64, terms: &[&str]) {
        let (uid, document, fields) = doc(path, mtime_ms, terms);
        writer.add_document(uid, document, fields);
    }

    #[test]
    fn test_commit_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        {
            let mut writer = store.writer().unwrap();
            add(&mut writer, "/a.c", 1, &["main", "int"]);
            add(&mut writer, "/b.c", 2, &["int"]);
            let stats = writer.commit().unwrap();
            assert_eq!(stats, CommitStats { added: 2, deleted: 0 });
        }
        assert!(store.writer().is_ok());

        let reopened = DocumentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.num_documents(), 2);
        let snap = reopened.snapshot();
        let hits: Vec<&str> = snap.search("int").into_iter().map(|(path, _)| path).collect();
        assert_eq!(hits, vec!["/a.c", "/b.c"]);
    }

    #[test]
    fn test_uncommitted_changes_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        {
            let mut writer = store.writer().unwrap();
            add(&mut writer, "/a.c", 1, &["main"]);
            assert_eq!(writer.pending(), 1);
        }
        assert_eq!(store.num_documents(), 0);
        assert_eq!(DocumentStore::open(dir.path()).unwrap().num_documents(), 0);
    }

    #[test]
    fn test_single_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let first = store.writer().unwrap();
        assert!(matches!(store.writer(), Err(SyncError::AlreadyRunning { .. })));
        // a second store over the same directory stands in for another process
        let other = DocumentStore::open(dir.path()).unwrap();
        assert!(matches!(other.writer(), Err(SyncError::AlreadyRunning { .. })));
        drop(first);
        assert!(store.writer().is_ok());
        assert!(other.writer().is_ok());
    }

    #[test]
    fn test_leftover_lock_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), b"").unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let mut writer = store.writer().unwrap();
        add(&mut writer, "/a.c", 1, &["main"]);
        assert_eq!(writer.commit().unwrap().added, 1);
    }

    #[test]
    fn test_delete_unlinks_postings() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let mut writer = store.writer().unwrap();
        add(&mut writer, "/a.c", 1, &["main", "helper"]);
        add(&mut writer, "/b.c", 1, &["helper"]);
        writer.commit().unwrap();
        writer.delete_document(&uid::encode("/a.c", 1));
        assert_eq!(writer.commit().unwrap().deleted, 1);
        drop(writer);

        let snap = store.snapshot();
        assert!(snap.search("main").is_empty());
        assert_eq!(snap.search("helper").len(), 1);
        // the emptied list lingers until compaction
        assert!(snap.postings.contains_key("main"));
        assert_eq!(store.compact().unwrap(), 1);
        assert!(!store.snapshot().postings.contains_key("main"));
    }

    #[test]
    fn test_document_frequencies() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let mut writer = store.writer().unwrap();
        add(&mut writer, "/a.c", 1, &["int", "main", "helper"]);
        add(&mut writer, "/b.c", 1, &["int", "helper"]);
        add(&mut writer, "/c.c", 1, &["int"]);
        writer.commit().unwrap();
        writer.delete_document(&uid::encode("/a.c", 1));
        writer.commit().unwrap();
        drop(writer);

        let snap = store.snapshot();
        // "main" lost its only document and is not listed even before compaction
        assert_eq!(snap.document_frequencies(0), vec![("helper", 1), ("int", 2)]);
        assert_eq!(snap.document_frequencies(2), vec![("int", 2)]);
        assert!(snap.document_frequencies(3).is_empty());
    }

    #[test]
    fn test_indexed_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(&dir.path().join("idx")).unwrap();
        assert_eq!(store.indexed_at(), None);
        store.mark_indexed().unwrap();
        assert!(store.indexed_at().unwrap() > 0);
    }

    #[test]
    fn test_cursor_walks_prefix_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let mut writer = store.writer().unwrap();
        add(&mut writer, "/proj/b.c", 1, &[]);
        add(&mut writer, "/proj/a.c", 2, &[]);
        add(&mut writer, "/project/x.c", 3, &[]);
        add(&mut writer, "/other/y.c", 4, &[]);
        writer.commit().unwrap();
        drop(writer);

        let paths: Vec<String> = store.cursor("/proj/").map(|u| uid::path_of(&u).to_string()).collect();
        assert_eq!(paths, vec!["/proj/a.c", "/proj/b.c"]);

        let mut cursor = store.cursor("/nothing/");
        assert!(cursor.peek().is_none());
        cursor.advance();
        assert!(cursor.peek().is_none());

        let all = store.cursor("/");
        assert_eq!(all.count(), 4);
    }

    #[test]
    fn test_cursor_sees_its_snapshot_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let mut writer = store.writer().unwrap();
        add(&mut writer, "/a.c", 1, &[]);
        writer.commit().unwrap();

        let cursor = store.cursor("/");
        add(&mut writer, "/b.c", 1, &[]);
        writer.commit().unwrap();
        assert_eq!(cursor.count(), 1);
        assert_eq!(store.cursor("/").count(), 2);
    }

    #[test]
    fn test_dirty_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(&dir.path().join("idx")).unwrap();
        assert!(!store.is_dirty());
        store.set_dirty().unwrap();
        assert!(store.is_dirty());
        store.clear_dirty().unwrap();
        store.clear_dirty().unwrap();
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_corrupt_data_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DOCUMENTS_FILE), b"junk").unwrap();
        assert!(matches!(DocumentStore::open(dir.path()), Err(SyncError::IndexLoad { .. })));
    }
}
