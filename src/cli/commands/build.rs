//! Build command - run a manifest through the stage cache

use crate::builder::{default_arch, BuildRequest, BuildSummary, Builder, HostRunner};
use crate::cache::gc::format_bytes;
use crate::cli::args::{BuildArgs, OutputFormat};
use crate::config::Config;
use crate::error::BuildResult;
use crate::manifest::Manifest;
use crate::store::Change;
use crate::ui::{self, StageProgress, UiContext};
use console::style;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> BuildResult<()> {
    let ctx = UiContext::detect();
    let manifest = Manifest::load(&args.manifest)?;
    let request = build_request(&args, config);
    debug!(
        "Building {} for {} into {} (state {})",
        manifest.id,
        request.arch,
        request.app_dir.display(),
        request.state_dir.display()
    );

    let runner = HostRunner::new(config.build.shell.clone());
    let progress = StageProgress::new(&ctx, &manifest.id);
    let result = Builder::new(&manifest, &runner, request)
        .on_stage(|stage| progress.on_stage(stage))
        .run()
        .await;
    progress.finish();
    let summary = result?;

    match args.format {
        OutputFormat::Json => print_summary_json(&summary)?,
        OutputFormat::Plain => print_summary_plain(&summary),
        OutputFormat::Table => print_summary_table(&ctx, &summary),
    }

    Ok(())
}

/// Combine command-line flags with configuration
fn build_request(args: &BuildArgs, config: &Config) -> BuildRequest {
    let state_dir = match &args.state_dir {
        Some(dir) => dir.clone(),
        None => resolve_against(manifest_dir(&args.manifest), &config.build.state_dir),
    };

    let mut request = BuildRequest::new(&args.app_dir, state_dir);
    request.arch = args
        .arch
        .clone()
        .or_else(|| config.build.arch.clone())
        .unwrap_or_else(|| default_arch().to_string());
    request.disable_cache = args.disable_cache || !config.cache.enabled;
    request.force_clean = args.force_clean;
    request.stop_at = args.stop_at.clone();
    request.run_gc = config.cache.gc && !args.no_gc;
    request.prune_other_branches = config.cache.prune_other_branches && !args.keep_other_branches;
    request.keep_build_dirs = args.keep_build_dirs || config.build.keep_build_dirs;
    request
}

fn manifest_dir(manifest: &Path) -> &Path {
    match manifest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn print_summary_table(ctx: &UiContext, summary: &BuildSummary) {
    ui::key_value(ctx, "branch", &summary.branch);
    ui::section(ctx, "Stages");
    for outcome in &summary.stages {
        if outcome.cached {
            ui::step_ok_detail(ctx, &outcome.stage, "cached");
        } else {
            ui::step_ok(ctx, &outcome.stage);
        }
    }

    if let Some(module) = &summary.stopped_at {
        ui::step_info(ctx, &format!("Stopped before module {}", module));
    }

    let cached = summary.stages.iter().filter(|s| s.cached).count();
    println!();
    println!(
        "{} stage(s), {} cached, {} changed path(s)",
        summary.stages.len(),
        cached,
        summary.changes.len()
    );
    for change in &summary.changes {
        println!("  {} {}", style(change.kind).dim(), change.path);
    }

    if let Some(report) = &summary.gc {
        println!(
            "{} Cache collected: {} branch(es) deleted, {} object(s) pruned, {} freed",
            style("✓").green(),
            report.deleted_refs.len(),
            report.stats.objects_pruned,
            format_bytes(report.stats.bytes_freed)
        );
    }
    if let Some(err) = &summary.gc_error {
        ui::step_warn_hint(
            ctx,
            &format!("Cache collection failed: {}", err),
            "the build itself succeeded",
        );
    }
}

fn print_summary_plain(summary: &BuildSummary) {
    for outcome in &summary.stages {
        let status = if outcome.cached { "cached" } else { "built" };
        println!("{} {}", outcome.stage, status);
    }
}

fn print_summary_json(summary: &BuildSummary) -> BuildResult<()> {
    #[derive(serde::Serialize)]
    struct GcJson {
        deleted_refs: Vec<String>,
        objects_total: usize,
        objects_pruned: usize,
        bytes_freed: u64,
    }

    #[derive(serde::Serialize)]
    struct SummaryJson<'a> {
        branch: &'a str,
        stages: &'a [crate::builder::StageOutcome],
        stopped_at: Option<&'a str>,
        changes: &'a [Change],
        gc: Option<GcJson>,
        gc_error: Option<&'a str>,
    }

    let json = SummaryJson {
        branch: &summary.branch,
        stages: &summary.stages,
        stopped_at: summary.stopped_at.as_deref(),
        changes: &summary.changes,
        gc: summary.gc.as_ref().map(|r| GcJson {
            deleted_refs: r.deleted_refs.clone(),
            objects_total: r.stats.objects_total,
            objects_pruned: r.stats.objects_pruned,
            bytes_freed: r.stats.bytes_freed,
        }),
        gc_error: summary.gc_error.as_deref(),
    };

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
