//! Index databases kept in step with the live source tree.
//!
//! One [`IndexDatabase`] exists per project, or one for the whole source
//! root. An update pass walks the tree in UID order next to a cursor over
//! the indexed UIDs of the same subtree and applies the difference through
//! a single writer (see [`merge`]).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, Project};
use crate::error::SyncError;
use crate::registry::pool::run_bounded;
use crate::registry::RepositoryRegistry;

pub mod accept;
pub mod analyzer;
pub mod merge;
pub mod store;
pub mod uid;
pub mod walk;

use accept::AcceptFilter;
use analyzer::{Analyzer, PlainTextAnalyzer, XrefStore};
use merge::{sorted_merge, MergeSink};
use store::{Document, DocumentStore, IndexWriter};
use walk::{LiveFile, SortedWalk};

/// Files between two progress lines.
const PROGRESS_INTERVAL: usize = 1000;

/// Notified as documents enter and leave an index.
pub trait IndexChangedListener: Send + Sync {
    fn file_add(&self, _path: &str, _analyzer: &str) {}
    fn file_added(&self, _path: &str, _analyzer: &str) {}
    fn file_remove(&self, _path: &str) {}
    fn file_removed(&self, _path: &str) {}
}

/// Counts of one update pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateStats {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Files that could not be read or analyzed.
    pub skipped: usize,
    pub interrupted: bool,
    /// Files counted up front when progress reporting is on.
    pub total_files: Option<usize>,
    pub elapsed_ms: u64,
}

impl UpdateStats {
    pub fn changed(&self) -> bool {
        self.added + self.modified + self.removed > 0
    }
}

/// A hit of [`IndexDatabase::search`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub lines: Vec<u32>,
}

/// Logs how far a pass has come against a pre-counted total.
struct Progress {
    index: String,
    total: usize,
    done: usize,
}

impl Progress {
    fn step(&mut self) {
        self.done += 1;
        if self.done % PROGRESS_INTERVAL == 0 || self.done == self.total {
            let percent = if self.total == 0 { 100 } else { self.done * 100 / self.total };
            info!(index = %self.index, done = self.done, total = self.total, percent, "Indexing progress");
        }
    }
}

/// Filesystem work of a pass, applied once its commit succeeded.
enum Effect {
    WriteXref { path: String, text: String },
    RemoveXref(String),
    EvictHistory(PathBuf),
}

/// Clears the running flag on drop.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool, index: &str) -> Result<Self, SyncError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::AlreadyRunning {
                index: index.to_string(),
            })?;
        Ok(Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct IndexDatabase {
    config: Arc<Config>,
    registry: Arc<RepositoryRegistry>,
    project: Option<Project>,
    source_root: PathBuf,
    store: DocumentStore,
    xref: XrefStore,
    analyzer: Arc<dyn Analyzer>,
    /// Source-root relative directories to synchronize.
    directories: RwLock<Vec<String>>,
    listeners: RwLock<Vec<Arc<dyn IndexChangedListener>>>,
    running: AtomicBool,
    interrupted: AtomicBool,
}

impl std::fmt::Debug for IndexDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDatabase")
            .field("name", &self.name())
            .field("dir", &self.store.dir())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl IndexDatabase {
    /// Open the database of `project`, or of the whole source root.
    pub fn open(
        config: Arc<Config>,
        registry: Arc<RepositoryRegistry>,
        project: Option<Project>,
    ) -> Result<Self, SyncError> {
        let source_root = std::fs::canonicalize(&config.source_root)?;
        let dir = match &project {
            Some(p) => config.index_root().join(&p.name),
            None => config.index_root(),
        };
        let store = DocumentStore::open(&dir)?;
        let analyzer: Arc<dyn Analyzer> = Arc::new(PlainTextAnalyzer::new(config.min_token_len, config.generate_xref));
        Ok(Self {
            xref: XrefStore::new(config.xref_root(), config.compress_xref),
            config,
            registry,
            project,
            source_root,
            store,
            analyzer,
            directories: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        })
    }

    /// One database per configured project, or one for the source root.
    pub fn open_all(config: Arc<Config>, registry: Arc<RepositoryRegistry>) -> Result<Vec<Arc<Self>>, SyncError> {
        if config.projects.is_empty() {
            return Ok(vec![Arc::new(Self::open(config, registry, None)?)]);
        }
        config
            .projects
            .iter()
            .map(|p| Self::open(config.clone(), registry.clone(), Some(p.clone())).map(Arc::new))
            .collect()
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn name(&self) -> &str {
        self.project.as_ref().map_or("default", |p| p.name.as_str())
    }

    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    pub fn index_dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn xref(&self) -> &XrefStore {
        &self.xref
    }

    pub fn add_listener(&self, listener: Arc<dyn IndexChangedListener>) -> Result<(), SyncError> {
        self.listeners.write()?.push(listener);
        Ok(())
    }

    /// Restrict the next passes to `dir` (source-root relative) in addition
    /// to directories added before.
    pub fn add_directory(&self, dir: &str) -> Result<(), SyncError> {
        let trimmed = dir.trim_matches('/');
        let dir = if trimmed.is_empty() { String::new() } else { format!("/{}", trimmed) };
        let mut dirs = self.directories.write()?;
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
        Ok(())
    }

    /// Directories a pass covers: the added ones, else the project path,
    /// else the whole source root.
    pub fn directories(&self) -> Vec<String> {
        let dirs = match self.directories.read() {
            Ok(dirs) => dirs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if !dirs.is_empty() {
            return dirs;
        }
        vec![self.project.as_ref().map_or_else(String::new, |p| p.path.clone())]
    }

    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop a running pass at the next file boundary.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Indexed paths in path order.
    pub fn files(&self) -> Vec<String> {
        self.store
            .snapshot()
            .documents
            .values()
            .map(|d| d.path.clone())
            .collect()
    }

    pub fn num_files(&self) -> usize {
        self.store.num_documents()
    }

    /// Tokens occurring in at least `min_docs` documents, with their
    /// document counts, in token order.
    pub fn list_tokens(&self, min_docs: usize) -> Vec<(String, usize)> {
        self.store
            .snapshot()
            .document_frequencies(min_docs)
            .into_iter()
            .map(|(token, docs)| (token.to_string(), docs))
            .collect()
    }

    /// Unix time at which the last complete, uninterrupted pass finished.
    pub fn indexed_at(&self) -> Option<u64> {
        self.store.indexed_at()
    }

    pub fn is_indexed(&self) -> bool {
        self.indexed_at().is_some()
    }

    /// Number of files the next pass would visit.
    pub fn count_files(&self) -> Result<usize, SyncError> {
        let filter = AcceptFilter::new(&self.config, self.project.as_ref(), self.registry.clone())?;
        Ok(self.count_live(&filter))
    }

    fn count_live(&self, filter: &AcceptFilter) -> usize {
        self.directories()
            .iter()
            .map(|dir| SortedWalk::new(filter, &self.absolute(dir), dir).count())
            .sum()
    }

    pub fn search(&self, token: &str) -> Vec<SearchHit> {
        let token = token.to_lowercase();
        self.store
            .snapshot()
            .search(&token)
            .into_iter()
            .map(|(path, lines)| SearchHit {
                path: path.to_string(),
                lines: lines.to_vec(),
            })
            .collect()
    }

    // ─── Update pass ────────────────────────────────────────────────

    /// Synchronize the index with the live tree.
    ///
    /// Fails with `AlreadyRunning` while another pass or an optimization
    /// holds this database. An error opening or committing the writer
    /// leaves the previously committed state in place.
    pub fn update(&self) -> Result<UpdateStats, SyncError> {
        let start = Instant::now();
        let guard = RunningGuard::acquire(&self.running, self.name())?;
        self.interrupted.store(false, Ordering::SeqCst);

        let mut writer = self.store.writer()?;
        let filter = AcceptFilter::new(&self.config, self.project.as_ref(), self.registry.clone())?;
        let listeners = match self.listeners.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut stats = UpdateStats::default();
        let mut progress = self.config.print_progress.then(|| Progress {
            index: self.name().to_string(),
            total: self.count_live(&filter),
            done: 0,
        });
        stats.total_files = progress.as_ref().map(|p| p.total);
        let mut effects = Vec::new();
        for dir in self.directories() {
            if self.is_interrupted() {
                stats.interrupted = true;
                break;
            }
            let dir_path = self.absolute(&dir);
            if self.config.history_enabled {
                if let Err(e) = self.registry.ensure_cache_up_to_date(&dir_path) {
                    warn!(dir = %dir_path.display(), error = %e, "History cache update failed");
                }
            }
            if !dir_path.is_dir() {
                warn!(index = self.name(), dir = %dir_path.display(), "Directory missing, its documents will be removed");
            }

            let mut cursor = self.store.cursor(&uid::subtree_prefix(&dir));
            let live = SortedWalk::new(&filter, &dir_path, &dir).map(|f| (f.uid(), f));
            let mut pass = Pass {
                db: self,
                writer: &mut writer,
                listeners: &listeners,
                stats: &mut stats,
                effects: &mut effects,
                progress: progress.as_mut(),
                pending: Vec::new(),
                last_path: None,
            };
            if !sorted_merge(&mut cursor, live, &mut pass) {
                stats.interrupted = true;
                break;
            }
            debug!(index = self.name(), dir = %dir, "Directory synchronized");
        }

        let committed = writer.commit()?;
        drop(writer);
        self.apply(effects);
        if committed.added + committed.deleted > 0 {
            self.store.set_dirty()?;
        }
        if !stats.interrupted {
            self.store.mark_indexed()?;
        }
        drop(guard);

        if stats.interrupted {
            warn!(index = self.name(), "Update interrupted, partial results committed");
        } else if self.config.optimize_database && self.store.is_dirty() {
            if let Err(e) = self.optimize() {
                warn!(index = self.name(), error = %e, "Optimization failed");
            }
        }

        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            index = self.name(),
            added = stats.added,
            modified = stats.modified,
            removed = stats.removed,
            unchanged = stats.unchanged,
            skipped = stats.skipped,
            elapsed_ms = stats.elapsed_ms,
            "Index update done"
        );
        Ok(stats)
    }

    /// Compact the store and clear the dirty marker.
    pub fn optimize(&self) -> Result<(), SyncError> {
        let start = Instant::now();
        let _guard = RunningGuard::acquire(&self.running, self.name())?;
        let _writer = self.store.writer()?;
        let dropped = self.store.compact()?;
        self.store.clear_dirty()?;
        info!(
            index = self.name(),
            dropped_terms = dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Index optimized"
        );
        Ok(())
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        self.source_root.join(rel.trim_start_matches('/'))
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::WriteXref { path, text } => {
                    if let Err(e) = self.xref.write(&path, &text) {
                        warn!(path = %path, error = %e, "Failed to write xref");
                    }
                }
                Effect::RemoveXref(path) => {
                    if let Err(e) = self.xref.remove(&path) {
                        warn!(path = %path, error = %e, "Failed to remove xref");
                    }
                }
                Effect::EvictHistory(path) => {
                    if let Err(e) = self.registry.clear_cache_file(&path) {
                        warn!(path = %path.display(), error = %e, "Failed to clear cached history");
                    }
                }
            }
        }
    }
}

/// Update `databases` concurrently on at most `workers` threads.
pub fn update_all(databases: &[Arc<IndexDatabase>], workers: usize) -> Vec<Result<UpdateStats, SyncError>> {
    run_bounded(databases, workers, |db| db.update())
}

/// Optimize the dirty ones among `databases`. `Ok(false)` marks a clean
/// database that was left alone.
pub fn optimize_all(databases: &[Arc<IndexDatabase>], workers: usize) -> Vec<Result<bool, SyncError>> {
    run_bounded(databases, workers, |db| {
        if db.is_dirty() {
            db.optimize().map(|_| true)
        } else {
            Ok(false)
        }
    })
}

// ─── Merge sink ─────────────────────────────────────────────────────

/// Applies merge decisions of one directory to the writer.
struct Pass<'p, 'w> {
    db: &'p IndexDatabase,
    writer: &'p mut IndexWriter<'w>,
    listeners: &'p [Arc<dyn IndexChangedListener>],
    stats: &'p mut UpdateStats,
    effects: &'p mut Vec<Effect>,
    progress: Option<&'p mut Progress>,
    /// Superseded UIDs, deleted once their replacement is analyzed.
    pending: Vec<String>,
    /// Path of the previous live file.
    last_path: Option<String>,
}

impl Pass<'_, '_> {
    fn delete(&mut self, uid: &str, evict_history: bool) {
        let path = uid::path_of(uid).to_string();
        for l in self.listeners {
            l.file_remove(&path);
        }
        self.writer.delete_document(uid);
        self.effects.push(Effect::RemoveXref(path.clone()));
        if evict_history && self.db.config.history_enabled {
            self.effects.push(Effect::EvictHistory(self.db.absolute(&path)));
        }
        for l in self.listeners {
            l.file_removed(&path);
        }
    }

    fn step(&mut self) {
        if let Some(progress) = self.progress.as_mut() {
            progress.step();
        }
    }

    fn flush_pending(&mut self) {
        for uid in std::mem::take(&mut self.pending) {
            self.delete(&uid, false);
        }
    }
}

impl MergeSink<LiveFile> for Pass<'_, '_> {
    fn interrupted(&self) -> bool {
        self.db.is_interrupted()
    }

    fn remove(&mut self, uid: &str, superseded: bool) {
        if superseded {
            self.pending.push(uid.to_string());
            return;
        }
        // an older entry of the file visited just before still has live history
        let still_live = self.last_path.as_deref() == Some(uid::path_of(uid));
        self.delete(uid, !still_live);
        if !still_live {
            self.stats.removed += 1;
        }
    }

    fn unchanged(&mut self, _uid: &str, item: LiveFile) {
        self.flush_pending();
        self.step();
        self.stats.unchanged += 1;
        self.last_path = Some(item.rel);
    }

    fn add(&mut self, uid: String, file: LiveFile, modified: bool) {
        self.step();
        let analyzer_name = self.db.analyzer.name().to_string();
        for l in self.listeners {
            l.file_add(&file.rel, &analyzer_name);
        }
        let analyzed = std::fs::read(&file.path)
            .map_err(SyncError::from)
            .and_then(|content| self.db.analyzer.analyze(&content, &file.path));
        let analyzed = match analyzed {
            Ok(analyzed) => analyzed,
            Err(e) => {
                match &e {
                    SyncError::UnsupportedContent { .. } => debug!(path = %file.rel, error = %e, "Skipping file"),
                    _ => warn!(path = %file.rel, error = %e, "Skipping file"),
                }
                // the previous document, if any, stays until the next pass
                self.pending.clear();
                self.stats.skipped += 1;
                self.last_path = Some(file.rel);
                return;
            }
        };
        self.flush_pending();

        let mut terms: Vec<String> = analyzed.fields.keys().cloned().collect();
        terms.sort_unstable();
        let document = Document {
            path: file.rel.clone(),
            mtime_ms: file.mtime_ms,
            size: file.size,
            project: self.db.project.as_ref().map(|p| p.name.clone()),
            analyzer: analyzer_name.clone(),
            token_count: analyzed.token_count,
            terms,
        };
        self.writer.add_document(uid, document, analyzed.fields);
        if self.db.config.generate_xref {
            if let Some(text) = analyzed.xref {
                self.effects.push(Effect::WriteXref {
                    path: file.rel.clone(),
                    text,
                });
            }
        }
        for l in self.listeners {
            l.file_added(&file.rel, &analyzer_name);
        }
        if modified {
            self.stats.modified += 1;
        } else {
            self.stats.added += 1;
        }
        self.last_path = Some(file.rel);
    }
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
