//! Cache garbage collection
//!
//! Collection always keeps the branches it is told to keep. With
//! `prune_other_branches`, every other ref is deleted first, then objects
//! no longer reachable from any ref are swept in a single prune pass.

use super::BuildCache;
use crate::error::{BuildError, BuildResult};
use crate::store::{CommitStore, PruneStats};
use tracing::{debug, info};

/// What a collection pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Branches whose refs were deleted, sorted
    pub deleted_refs: Vec<String>,
    pub stats: PruneStats,
}

/// Format bytes as human-readable size (e.g., "1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Collect garbage for the session's store, keeping the session's branch
pub fn run(cache: &mut BuildCache, prune_other_branches: bool) -> BuildResult<GcReport> {
    let branch = cache.branch().to_string();
    collect(cache.store_mut(), &[branch.as_str()], prune_other_branches)
}

/// Collect garbage in `store`, never touching the refs in `keep`
pub fn collect(
    store: &mut dyn CommitStore,
    keep: &[&str],
    prune_other_branches: bool,
) -> BuildResult<GcReport> {
    let mut report = GcReport::default();

    if prune_other_branches {
        let refs = store.list_refs().map_err(gc_error)?;
        for branch in refs.into_iter().filter(|r| !keep.contains(&r.as_str())) {
            debug!("Deleting ref {}", branch);
            store.delete_ref(&branch).map_err(gc_error)?;
            report.deleted_refs.push(branch);
        }
    }

    report.stats = store.prune_unreferenced().map_err(gc_error)?;
    info!(
        "Pruned {} of {} object(s), freed {}",
        report.stats.objects_pruned,
        report.stats.objects_total,
        format_bytes(report.stats.bytes_freed)
    );
    Ok(report)
}

fn gc_error(e: BuildError) -> BuildError {
    BuildError::Gc(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{run_stage, FailingPrune, Fixture};
    use crate::store::FsRepo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn populate(fx: &Fixture, branch: &str) {
        let mut cache = fx.open(branch);
        run_stage(&mut cache, "init", branch);
    }

    #[test]
    fn keeps_other_branches_by_default() {
        let fx = Fixture::new();
        populate(&fx, "x86_64-one");
        populate(&fx, "x86_64-two");

        let mut cache = fx.open("x86_64-one");
        let report = run(&mut cache, false).unwrap();
        assert!(report.deleted_refs.is_empty());
        assert_eq!(report.stats.objects_pruned, 0);
        assert!(cache.store().resolve_ref("x86_64-two").unwrap().is_some());
    }

    #[test]
    fn prune_other_branches_deletes_refs_and_objects() {
        let fx = Fixture::new();
        populate(&fx, "x86_64-one");
        populate(&fx, "x86_64-two");
        populate(&fx, "x86_64-three");

        let mut cache = fx.open("x86_64-one");
        let report = run(&mut cache, true).unwrap();
        assert_eq!(report.deleted_refs, vec!["x86_64-three", "x86_64-two"]);
        assert!(report.stats.objects_pruned > 0);
        assert_eq!(cache.store().list_refs().unwrap(), vec!["x86_64-one"]);

        // Kept branch still fully readable
        let mut cache = fx.open("x86_64-one");
        assert!(run_stage(&mut cache, "init", "x86_64-one").is_hit());
        std::fs::remove_dir_all(fx.app_dir()).unwrap();
        cache.ensure_checkout().unwrap();
        assert!(fx.app_dir().join("init").exists());
    }

    #[test]
    fn kept_branch_need_not_exist() {
        let fx = Fixture::new();
        populate(&fx, "old");

        let mut cache = fx.open("new");
        let report = run(&mut cache, true).unwrap();
        assert_eq!(report.deleted_refs, vec!["old"]);
        assert!(cache.store().list_refs().unwrap().is_empty());
    }

    #[test]
    fn collect_is_idempotent() {
        let fx = Fixture::new();
        populate(&fx, "a");
        populate(&fx, "b");

        let mut repo = FsRepo::open_or_init(&fx.store_path()).unwrap();
        collect(&mut repo, &["a"], true).unwrap();
        let second = collect(&mut repo, &["a"], true).unwrap();
        assert!(second.deleted_refs.is_empty());
        assert_eq!(second.stats.objects_pruned, 0);
    }

    #[test]
    fn prune_failure_is_reported_after_a_single_attempt() {
        let fx = Fixture::new();
        populate(&fx, "other");

        let prunes = Arc::new(AtomicUsize::new(0));
        let store = FailingPrune::new(
            FsRepo::open_or_init(&fx.store_path()).unwrap(),
            Arc::clone(&prunes),
        );
        let mut cache = BuildCache::with_store(Box::new(store), "main", &fx.app_dir()).unwrap();

        let err = run(&mut cache, true).unwrap_err();
        assert!(matches!(err, BuildError::Gc(_)));
        assert!(err.to_string().contains("disk on fire"));
        assert_eq!(prunes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.0 GB");
    }
}
