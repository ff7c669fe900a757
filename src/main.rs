//! Stagebuild - manifest-driven application builder
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use stagebuild::cli::{Cli, Commands};
use stagebuild::config::ConfigManager;
use stagebuild::error::BuildResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> BuildResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn (progress only), 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("stagebuild=warn"),
        1 => EnvFilter::new("stagebuild=info"),
        _ => EnvFilter::new("stagebuild=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
    debug!("Loaded configuration from {}", config_manager.path().display());

    match cli.command {
        Commands::Build(args) => stagebuild::cli::commands::build(args, &config).await,
        Commands::Manifest(args) => stagebuild::cli::commands::manifest(args).await,
        Commands::Cache(args) => stagebuild::cli::commands::cache(args, &config).await,
        Commands::Config(args) => {
            stagebuild::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
