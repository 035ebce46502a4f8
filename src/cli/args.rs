//! CLI argument structs for all subcommands.

use std::path::PathBuf;

use clap::{Args, Parser};

/// Options shared by every subcommand.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root of the source tree (overrides the configuration file)
    #[arg(long, global = true)]
    pub source_root: Option<PathBuf>,

    /// Directory for indexes, xrefs and the history cache
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Parser, Debug)]
pub struct DiscoverArgs {
    /// Maximum directory depth probed (default: configured scanning depth)
    #[arg(long)]
    pub depth: Option<usize>,
}

#[derive(Parser, Debug)]
pub struct HistoryArgs {
    /// File or directory inside a repository
    pub path: PathBuf,

    /// Include the changed files of every entry
    #[arg(long)]
    pub files: bool,

    /// Print JSON lines instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct AnnotateArgs {
    /// File inside a repository
    pub file: PathBuf,

    /// Revision to annotate (default: working copy)
    #[arg(long)]
    pub rev: Option<String>,
}

#[derive(Parser, Debug)]
pub struct UpdateReposArgs {
    /// Repository roots to update (default: all discovered)
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Clear the cached history of these repository roots instead of populating
    #[arg(long, num_args = 1..)]
    pub clear: Vec<PathBuf>,

    /// Also forget the cleared repositories
    #[arg(long, requires = "clear")]
    pub remove: bool,
}

#[derive(Parser, Debug)]
pub struct IndexArgs {
    /// Source-root relative directories to synchronize (default: everything)
    pub paths: Vec<String>,

    /// Skip files without version history
    #[arg(long)]
    pub versioned_only: bool,

    /// Do not consult or update history
    #[arg(long)]
    pub no_history: bool,

    /// Optimize after the pass even when disabled in the configuration
    #[arg(long)]
    pub optimize: bool,

    /// Count files first and log progress during the pass
    #[arg(long)]
    pub progress: bool,

    /// Databases updated in parallel (0 = auto)
    #[arg(short, long, default_value = "0")]
    pub threads: usize,
}

#[derive(Parser, Debug)]
pub struct SearchArgs {
    /// Token to look up (case-insensitive)
    pub token: String,

    /// Show only the number of matching files
    #[arg(short = 'c', long)]
    pub count: bool,
}

#[derive(Parser, Debug)]
pub struct TokensArgs {
    /// Only tokens found in at least this many files
    #[arg(short = 'm', long, default_value = "1")]
    pub min_freq: usize,
}
