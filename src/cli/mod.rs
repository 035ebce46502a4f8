//! CLI layer: argument parsing, command dispatch, and subcommand implementations.

pub mod args;
mod info;

pub use args::*;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use reposync::history::format_timestamp;
use reposync::index::{self, IndexDatabase};
use reposync::names::NameFilter;
use reposync::registry::RepositoryRegistry;
use reposync::{Config, SyncError};

// ─── CLI ─────────────────────────────────────────────────────────────

/// Repository discovery, history caching and index synchronization for code search
#[derive(Parser, Debug)]
#[command(name = "reposync", version, about, after_help = "\
Run 'reposync <COMMAND> --help' for detailed options.\n\
Common options: --config <FILE>, --source-root <DIR>, --data-root <DIR>")]
pub(crate) struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Find repositories under the source root
    Discover(DiscoverArgs),

    /// Show the history of a file or directory
    History(HistoryArgs),

    /// Show per-line revision and author of a file
    Annotate(AnnotateArgs),

    /// Pull upstream changes into the working copies
    UpdateRepos(UpdateReposArgs),

    /// Populate (or clear) the history cache
    Cache(CacheArgs),

    /// Synchronize the index databases with the source tree
    Index(IndexArgs),

    /// Compact dirty index databases
    Optimize,

    /// List indexed files
    Files,

    /// Look up a token in the index
    Search(SearchArgs),

    /// List indexed tokens with the number of files containing them
    Tokens(TokensArgs),

    /// Show configuration, repositories and index state
    Info,
}

// ─── Main entry point ───────────────────────────────────────────────

pub fn run() {
    let cli = Cli::parse();
    init_logging(&cli.global.log_level, cli.global.log_json);

    let result = load_config(&cli.global).and_then(|config| {
        let config = Arc::new(config);
        match cli.command {
            Commands::Discover(args) => cmd_discover(config, args),
            Commands::History(args) => cmd_history(config, args),
            Commands::Annotate(args) => cmd_annotate(config, args),
            Commands::UpdateRepos(args) => cmd_update_repos(config, args),
            Commands::Cache(args) => cmd_cache(config, args),
            Commands::Index(args) => cmd_index(config, args),
            Commands::Optimize => cmd_optimize(config),
            Commands::Files => cmd_files(config),
            Commands::Search(args) => cmd_search(config, args),
            Commands::Tokens(args) => cmd_tokens(config, args),
            Commands::Info => info::cmd_info(config),
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str, json: bool) {
    let log_level = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };
    let builder = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Configuration file (or defaults) with the command-line overrides applied.
pub(crate) fn load_config(global: &GlobalArgs) -> Result<Config, SyncError> {
    let mut config = match &global.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(root) = &global.source_root {
        config.source_root = root.clone();
    }
    if let Some(root) = &global.data_root {
        config.data_root = root.clone();
    }
    if !config.source_root.is_dir() {
        return Err(SyncError::InvalidArgs(format!(
            "Source root '{}' is not a directory",
            config.source_root.display()
        )));
    }
    Ok(config)
}

/// Registry populated by discovery over the source root.
fn discovered_registry(config: &Arc<Config>, depth: Option<usize>) -> Result<Arc<RepositoryRegistry>, SyncError> {
    let registry = Arc::new(RepositoryRegistry::new(config.clone()));
    let ignored = NameFilter::ignored(&config.ignored_names)?;
    let root = std::fs::canonicalize(&config.source_root)?;
    registry.discover(&[root], &ignored, depth.unwrap_or(config.scanning_depth))?;
    Ok(registry)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), SyncError> {
    let line = serde_json::to_string(value).map_err(|e| SyncError::InvalidArgs(e.to_string()))?;
    println!("{}", line);
    Ok(())
}

// ─── Repository commands ────────────────────────────────────────────

fn cmd_discover(config: Arc<Config>, args: DiscoverArgs) -> Result<(), SyncError> {
    let registry = discovered_registry(&config, args.depth)?;
    for descriptor in registry.repositories() {
        print_json(&descriptor)?;
    }
    eprintln!("{} repositories", registry.len());
    Ok(())
}

fn cmd_history(config: Arc<Config>, args: HistoryArgs) -> Result<(), SyncError> {
    let registry = discovered_registry(&config, None)?;
    let Some(history) = registry.get_history(&args.path, args.files, true)? else {
        eprintln!("No history for {}", args.path.display());
        return Ok(());
    };
    for entry in history.entries() {
        if args.json {
            print_json(entry)?;
            continue;
        }
        let tags = entry.tags.as_deref().map(|t| format!(" [{}]", t)).unwrap_or_default();
        println!("{} {} {}{}", entry.revision, format_timestamp(entry.date), entry.author, tags);
        println!("    {}", entry.message.lines().next().unwrap_or(""));
        for file in &entry.files {
            println!("    {}", file);
        }
    }
    Ok(())
}

fn cmd_annotate(config: Arc<Config>, args: AnnotateArgs) -> Result<(), SyncError> {
    let registry = discovered_registry(&config, None)?;
    let Some(annotation) = registry.annotate(&args.file, args.rev.as_deref())? else {
        eprintln!("No annotation for {}", args.file.display());
        return Ok(());
    };
    for (idx, line) in annotation.lines().iter().enumerate() {
        let version = annotation
            .file_version(&line.revision)
            .map(|v| format!("#{}", v))
            .unwrap_or_default();
        println!("{:>6} {:<12}{:<5} {}", idx + 1, line.revision, version, line.author);
    }
    Ok(())
}

fn cmd_update_repos(config: Arc<Config>, args: UpdateReposArgs) -> Result<(), SyncError> {
    let registry = discovered_registry(&config, None)?;
    let roots = (!args.paths.is_empty()).then_some(args.paths.as_slice());
    let report = registry.update_repositories(roots);
    print_json(&report)?;
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(SyncError::InvalidArgs(format!("{} repositories failed to update", report.failed.len())))
    }
}

fn cmd_cache(config: Arc<Config>, args: CacheArgs) -> Result<(), SyncError> {
    let registry = discovered_registry(&config, None)?;
    if !args.clear.is_empty() {
        let cleared = if args.remove {
            registry.remove_cache(&args.clear)?
        } else {
            registry.clear_cache(&args.clear)
        };
        for root in &cleared {
            println!("{}", root.display());
        }
        eprintln!("Cleared {} of {} repositories", cleared.len(), args.clear.len());
        return Ok(());
    }
    let report = registry.create_cache_all()?;
    print_json(&report)?;
    if let Some(cache) = registry.cache() {
        eprintln!("{}", cache.info());
    }
    Ok(())
}

// ─── Index commands ─────────────────────────────────────────────────

fn cmd_index(config: Arc<Config>, args: IndexArgs) -> Result<(), SyncError> {
    let mut overridden = (*config).clone();
    if args.no_history {
        overridden.history_enabled = false;
    }
    if args.versioned_only {
        overridden.index_versioned_files_only = true;
    }
    if args.progress {
        overridden.print_progress = true;
    }
    let optimize_requested = args.optimize && !overridden.optimize_database;
    let config = Arc::new(overridden);

    let registry = if config.history_enabled {
        discovered_registry(&config, None)?
    } else {
        Arc::new(RepositoryRegistry::new(config.clone()))
    };
    let databases = IndexDatabase::open_all(config.clone(), registry)?;
    for path in &args.paths {
        assign_directory(&databases, path)?;
    }

    let handles = databases.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        for db in &handles {
            db.interrupt();
        }
    }) {
        warn!(error = %e, "Cannot install interrupt handler");
    }

    let workers = if args.threads == 0 { config.worker_count() } else { args.threads };
    let mut failed = 0;
    for (db, result) in databases.iter().zip(index::update_all(&databases, workers)) {
        match result {
            Ok(stats) => {
                print_json(&serde_json::json!({ "index": db.name(), "stats": stats }))?;
            }
            Err(e) => {
                eprintln!("Index '{}' failed: {}", db.name(), e);
                failed += 1;
            }
        }
    }
    if optimize_requested {
        for (db, result) in databases.iter().zip(index::optimize_all(&databases, workers)) {
            if let Err(e) = result {
                eprintln!("Optimizing '{}' failed: {}", db.name(), e);
            }
        }
    }
    if failed > 0 {
        return Err(SyncError::InvalidArgs(format!("{} index update(s) failed", failed)));
    }
    Ok(())
}

/// Route a source-root relative directory to the database that owns it.
fn assign_directory(databases: &[Arc<IndexDatabase>], path: &str) -> Result<(), SyncError> {
    let rel = format!("/{}", path.trim_matches('/'));
    let owner = databases.iter().find(|db| match db.project() {
        Some(p) => rel == p.path || rel.starts_with(&format!("{}/", p.path)),
        None => true,
    });
    match owner {
        Some(db) => db.add_directory(&rel),
        None => Err(SyncError::InvalidArgs(format!("'{}' is not inside any project", path))),
    }
}

fn open_databases(config: &Arc<Config>) -> Result<Vec<Arc<IndexDatabase>>, SyncError> {
    let registry = Arc::new(RepositoryRegistry::new(config.clone()));
    IndexDatabase::open_all(config.clone(), registry)
}

fn cmd_optimize(config: Arc<Config>) -> Result<(), SyncError> {
    let databases = open_databases(&config)?;
    for (db, result) in databases.iter().zip(index::optimize_all(&databases, config.worker_count())) {
        match result {
            Ok(true) => info!(index = db.name(), "Optimized"),
            Ok(false) => info!(index = db.name(), "Clean, nothing to do"),
            Err(e) => eprintln!("Optimizing '{}' failed: {}", db.name(), e),
        }
    }
    Ok(())
}

fn cmd_files(config: Arc<Config>) -> Result<(), SyncError> {
    for db in open_databases(&config)? {
        for path in db.files() {
            println!("{}", path);
        }
    }
    Ok(())
}

fn cmd_search(config: Arc<Config>, args: SearchArgs) -> Result<(), SyncError> {
    let mut total = 0;
    for db in open_databases(&config)? {
        let hits = db.search(&args.token);
        total += hits.len();
        if args.count {
            continue;
        }
        for hit in hits {
            let lines: Vec<String> = hit.lines.iter().map(|l| l.to_string()).collect();
            println!("{}:{}", hit.path, lines.join(","));
        }
    }
    if args.count {
        println!("{}", total);
    }
    Ok(())
}

fn cmd_tokens(config: Arc<Config>, args: TokensArgs) -> Result<(), SyncError> {
    for db in open_databases(&config)? {
        for (token, files) in db.list_tokens(args.min_freq) {
            println!("{}\t{}", files, token);
        }
    }
    Ok(())
}
