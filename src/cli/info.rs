//! info command.

use std::sync::Arc;

use reposync::history::format_timestamp;
use reposync::index::IndexDatabase;
use reposync::registry::RepositoryRegistry;
use reposync::{Config, SyncError};

pub fn cmd_info(config: Arc<Config>) -> Result<(), SyncError> {
    eprintln!("Source root: {}", config.source_root.display());
    eprintln!("Data root:   {}", config.data_root.display());
    eprintln!(
        "History:     {} (cache {}, tags {}, remote {:?})",
        on_off(config.history_enabled),
        on_off(config.history_cache),
        on_off(config.tags_enabled),
        config.remote_scm
    );
    eprintln!();

    let registry = Arc::new(RepositoryRegistry::new(config.clone()));
    if let Some(cache) = registry.cache() {
        println!("  [HISTORY] {}", cache.info());
    }

    let index_root = config.index_root();
    if !index_root.exists() {
        eprintln!("No indexes found. Use 'reposync index' to create one.");
        return Ok(());
    }
    for db in IndexDatabase::open_all(config.clone(), registry)? {
        let dirty = if db.is_dirty() { " [DIRTY]" } else { "" };
        let indexed = match db.indexed_at() {
            Some(at) => format!("indexed {}", format_timestamp(at as i64)),
            None => "never fully indexed".to_string(),
        };
        let size = std::fs::metadata(db.index_dir().join("documents.bin"))
            .map(|m| m.len())
            .unwrap_or(0);
        println!(
            "  [INDEX] {} -- {} files, {:.1} MB{}, {} ({})",
            db.name(),
            db.num_files(),
            size as f64 / 1_048_576.0,
            dirty,
            indexed,
            db.index_dir().display()
        );
    }
    Ok(())
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}
