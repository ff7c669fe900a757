//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Stagebuild - manifest-driven application builder
///
/// Builds an application directory stage by stage and reuses every stage
/// whose inputs are unchanged since the last build.
#[derive(Parser, Debug)]
#[command(name = "stagebuild")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STAGEBUILD_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an application directory from a manifest
    Build(BuildArgs),

    /// Print the resolved manifest with all module files inlined
    Manifest(ManifestArgs),

    /// Inspect and collect the stage cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Manifest file (JSON)
    pub manifest: PathBuf,

    /// Directory the application is built into
    pub app_dir: PathBuf,

    /// Architecture to build for (default: from config, then host)
    #[arg(long)]
    pub arch: Option<String>,

    /// Rebuild every stage; the cache is still refreshed
    #[arg(long)]
    pub disable_cache: bool,

    /// Empty the app directory if it is not empty
    #[arg(long)]
    pub force_clean: bool,

    /// Stop before building this module (skips cleanup and finish)
    #[arg(long, value_name = "MODULE")]
    pub stop_at: Option<String>,

    /// Keep cache branches of other manifests and architectures
    #[arg(long)]
    pub keep_other_branches: bool,

    /// Skip garbage collection after the build
    #[arg(long)]
    pub no_gc: bool,

    /// Keep per-module build directories
    #[arg(long)]
    pub keep_build_dirs: bool,

    /// State directory holding the cache (default: from config, relative to the manifest)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Output format for the build report
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the manifest command
#[derive(Parser, Debug)]
pub struct ManifestArgs {
    /// Manifest file (JSON)
    pub manifest: PathBuf,

    /// Print the cache branch for this architecture instead
    #[arg(long, value_name = "ARCH")]
    pub branch_key: Option<String>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// State directory holding the cache (default: from config, relative to the current directory)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached branches
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show the stages cached on a branch, newest first
    Log {
        /// Branch name, e.g. x86_64-org.example.App
        branch: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Delete unreachable objects
    Gc {
        /// Branch to keep when pruning others (repeatable)
        #[arg(long = "keep-branch", value_name = "BRANCH")]
        keep_branches: Vec<String>,

        /// Delete every branch not named by --keep-branch
        #[arg(long)]
        prune_others: bool,
    },
}
