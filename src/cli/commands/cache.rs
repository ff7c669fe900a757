//! Cache command - inspect and collect the stage cache

use crate::builder::CACHE_DIR;
use crate::cache::gc::{self, format_bytes};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::{BuildError, BuildResult};
use crate::store::{CommitInfo, CommitStore, FsRepo};
use console::style;
use std::path::PathBuf;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> BuildResult<()> {
    let store_path = args
        .state_dir
        .unwrap_or_else(|| config.build.state_dir.clone())
        .join(CACHE_DIR);
    debug!("Using cache at {}", store_path.display());

    match args.action {
        CacheAction::List { format } => {
            let repo = open_existing(store_path)?;
            let branches = branch_summaries(&repo)?;
            match format {
                OutputFormat::Table => print_branch_table(&branches),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&branches)?),
                OutputFormat::Plain => branches.iter().for_each(|b| println!("{}", b.branch)),
            }
            Ok(())
        }
        CacheAction::Log { branch, format } => {
            let repo = open_existing(store_path)?;
            let tip = repo
                .resolve_ref(&branch)?
                .ok_or_else(|| BuildError::User(format!("No cached branch named {}", branch)))?;
            let history = repo.log(&tip)?;
            match format {
                OutputFormat::Table => print_log_table(&history),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&history)?),
                OutputFormat::Plain => history.iter().for_each(|c| println!("{}", c.id)),
            }
            Ok(())
        }
        CacheAction::Gc {
            keep_branches,
            prune_others,
        } => {
            let mut repo = open_existing(store_path)?;
            let keep: Vec<&str> = keep_branches.iter().map(String::as_str).collect();
            let report = gc::collect(&mut repo, &keep, prune_others)?;

            for branch in &report.deleted_refs {
                println!("  {} {}", style("-").red(), branch);
            }
            println!(
                "{} Pruned {} of {} object(s), freed {}",
                style("✓").green(),
                report.stats.objects_pruned,
                report.stats.objects_total,
                format_bytes(report.stats.bytes_freed)
            );
            Ok(())
        }
    }
}

/// One cached branch
#[derive(Debug, Clone, serde::Serialize)]
struct BranchSummary {
    branch: String,
    tip: String,
    stages: usize,
    last_stage: String,
    updated_at: String,
}

fn open_existing(store_path: PathBuf) -> BuildResult<FsRepo> {
    if !store_path.exists() {
        return Err(BuildError::User(format!(
            "No stage cache at {}",
            store_path.display()
        )));
    }
    FsRepo::open_or_init(&store_path)
}

fn branch_summaries(repo: &dyn CommitStore) -> BuildResult<Vec<BranchSummary>> {
    let mut out = Vec::new();
    for branch in repo.list_refs()? {
        let Some(tip) = repo.resolve_ref(&branch)? else {
            continue;
        };
        let history = repo.log(&tip)?;
        let Some(newest) = history.first() else {
            continue;
        };
        out.push(BranchSummary {
            last_stage: newest.metadata.stage_name.clone(),
            updated_at: newest.timestamp.to_rfc3339(),
            stages: history.len(),
            tip,
            branch,
        });
    }
    Ok(out)
}

fn print_branch_table(branches: &[BranchSummary]) {
    if branches.is_empty() {
        println!("No cached branches.");
        return;
    }

    println!("{:<40} {:<14} {:<8} {:<12}", "BRANCH", "TIP", "STAGES", "LAST STAGE");
    println!("{}", "-".repeat(80));
    for b in branches {
        println!(
            "{:<40} {:<14} {:<8} {:<12}",
            b.branch,
            short_id(&b.tip),
            b.stages,
            b.last_stage
        );
    }
    println!();
    println!("Total: {} branch(es)", branches.len());
}

fn print_log_table(history: &[CommitInfo]) {
    println!("{:<14} {:<24} {:<20} {:<14}", "COMMIT", "STAGE", "CREATED", "KEY");
    println!("{}", "-".repeat(80));
    for commit in history {
        println!(
            "{:<14} {:<24} {:<20} {:<14}",
            short_id(&commit.id),
            commit.metadata.stage_name,
            commit.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            short_id(&commit.metadata.cache_key)
        );
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
