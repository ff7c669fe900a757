//! Incremental stage cache
//!
//! Each build runs as a sequence of named stages. Before a stage runs, the
//! caller folds everything that can affect its output into the stage
//! checksum and asks [`BuildCache::lookup`]. On a hit the stage is skipped;
//! on a miss the caller does the work in the app directory and calls
//! [`BuildCache::commit`], which snapshots that directory into the store.
//!
//! # Key chaining
//!
//! Every stage's checksum starts with [`CHECKSUM_VERSION`] followed by the
//! previous stage's cache key, so a stage key covers the full history of
//! inputs up to that point. A changed input therefore invalidates every
//! later stage, even ones whose own material is unchanged.
//!
//! # Lineage
//!
//! The branch ref points at the newest commit. On open, the commit chain is
//! walked back to its root and replayed as [`Element`]s, so a new process
//! resumes exactly where the previous build left off.

pub mod changes;
pub mod gc;

use crate::checksum::{Checksum, CHECKSUM_VERSION};
use crate::error::{BuildError, BuildResult};
use crate::store::{CommitId, CommitMetadata, CommitStore, FsRepo};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One stage in the current lineage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Stage name, e.g. `init` or `build-zlib`
    pub stage: String,
    /// Hex digest of the stage checksum
    pub cache_key: String,
    /// Commit holding the app directory after this stage
    pub commit: CommitId,
}

/// Outcome of a stage lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit)
    }
}

/// A stage that missed and has not been committed yet
#[derive(Debug, Clone)]
struct PendingStage {
    stage: String,
    cache_key: String,
}

/// Build cache session for one branch
pub struct BuildCache {
    store: Box<dyn CommitStore>,
    branch: String,
    app_dir: PathBuf,
    checksum: Checksum,
    elements: Vec<Element>,
    /// Number of elements confirmed by this session (hit or committed)
    position: usize,
    session_start: Option<CommitId>,
    /// What the app directory currently holds; `None` until first materialized
    checked_out: Option<Option<CommitId>>,
    pending: Option<PendingStage>,
    lookups_disabled: bool,
}

impl BuildCache {
    /// Open (or create) the store at `store_path` and start a session on `branch`
    pub fn open(store_path: &Path, branch: &str, app_dir: &Path) -> BuildResult<Self> {
        let store = FsRepo::open_or_init(store_path)?;
        Self::with_store(Box::new(store), branch, app_dir)
    }

    /// Start a session on `branch` using an already opened store
    pub fn with_store(
        store: Box<dyn CommitStore>,
        branch: &str,
        app_dir: &Path,
    ) -> BuildResult<Self> {
        let tip = store.resolve_ref(branch)?;

        let elements = match &tip {
            Some(tip) => {
                let mut lineage = store.log(tip)?;
                lineage.reverse();
                lineage
                    .into_iter()
                    .map(|c| Element {
                        stage: c.metadata.stage_name,
                        cache_key: c.metadata.cache_key,
                        commit: c.id,
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        match &tip {
            Some(tip) => info!(
                "Resuming branch {} at {} ({} cached stage(s))",
                branch,
                &tip[..12],
                elements.len()
            ),
            None => info!("Starting new branch {}", branch),
        }

        let mut cache = Self {
            store,
            branch: branch.to_string(),
            app_dir: app_dir.to_path_buf(),
            checksum: Checksum::new(),
            elements,
            position: 0,
            session_start: tip,
            checked_out: None,
            pending: None,
            lookups_disabled: false,
        };
        cache.reseed(None);
        Ok(cache)
    }

    /// Start the next stage's checksum from the version and previous key
    fn reseed(&mut self, previous_key: Option<&str>) {
        self.checksum.reset();
        self.checksum.update_str(Some(CHECKSUM_VERSION));
        self.checksum.update_str(previous_key);
    }

    /// The current stage's checksum accumulator
    pub fn checksum(&mut self) -> &mut Checksum {
        &mut self.checksum
    }

    /// Force every lookup to miss; commits still record real cache keys
    pub fn disable_lookups(&mut self) {
        self.lookups_disabled = true;
    }

    pub fn lookups_disabled(&self) -> bool {
        self.lookups_disabled
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// Stages confirmed so far plus any stale ones not yet re-evaluated
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Commit at the current chain position
    pub fn head(&self) -> Option<&str> {
        self.position
            .checked_sub(1)
            .map(|i| self.elements[i].commit.as_str())
    }

    /// Branch tip when the session was opened
    pub fn session_start(&self) -> Option<&str> {
        self.session_start.as_deref()
    }

    pub(crate) fn store(&self) -> &dyn CommitStore {
        self.store.as_ref()
    }

    pub(crate) fn store_mut(&mut self) -> &mut dyn CommitStore {
        self.store.as_mut()
    }

    /// Check whether `stage` with the accumulated checksum was already built
    ///
    /// On a miss, every stale element from this position on is discarded
    /// and the stage must be committed before the next lookup.
    pub fn lookup(&mut self, stage: &str) -> BuildResult<CacheStatus> {
        if let Some(pending) = &self.pending {
            return Err(BuildError::StageOrder(format!(
                "lookup of '{}' while '{}' is waiting to be committed",
                stage, pending.stage
            )));
        }

        let cache_key = self.checksum.digest();
        self.reseed(Some(&cache_key));

        if !self.lookups_disabled {
            if let Some(element) = self.elements.get(self.position) {
                if element.stage == stage && element.cache_key == cache_key {
                    debug!("Cache hit for {} ({})", stage, &cache_key[..12]);
                    self.position += 1;
                    return Ok(CacheStatus::Hit);
                }
            }
        }

        if self.elements.len() > self.position {
            debug!(
                "Discarding {} stale stage(s) from {}",
                self.elements.len() - self.position,
                stage
            );
            self.elements.truncate(self.position);
        }

        debug!("Cache miss for {} ({})", stage, &cache_key[..12]);
        self.pending = Some(PendingStage {
            stage: stage.to_string(),
            cache_key,
        });
        Ok(CacheStatus::Miss)
    }

    /// Make the app directory match the current chain position
    ///
    /// After a run of hits the app directory is behind; this checks out
    /// the last hit commit (or leaves an empty directory when nothing has
    /// been built yet). No-op when already up to date.
    pub fn ensure_checkout(&mut self) -> BuildResult<()> {
        let head = self.head().map(str::to_string);
        if self.checked_out.as_ref() == Some(&head) {
            return Ok(());
        }

        if self.app_dir.exists() {
            fs::remove_dir_all(&self.app_dir).map_err(|e| {
                BuildError::store_io("clearing app directory", &self.app_dir, e)
            })?;
        }

        match &head {
            Some(commit) => {
                debug!("Checking out {} into {}", &commit[..12], self.app_dir.display());
                self.store.checkout(commit, &self.app_dir)?;
            }
            None => {
                fs::create_dir_all(&self.app_dir).map_err(|e| {
                    BuildError::store_io("creating app directory", &self.app_dir, e)
                })?;
            }
        }

        self.checked_out = Some(head);
        Ok(())
    }

    /// Snapshot the app directory as the result of the stage that just missed
    pub fn commit(&mut self, stage: &str, message: &str) -> BuildResult<CommitId> {
        let pending = match self.pending.take() {
            Some(p) if p.stage == stage => p,
            other => {
                let reason = match &other {
                    Some(p) => format!("commit of '{}' but '{}' was looked up", stage, p.stage),
                    None => format!("commit of '{}' without a preceding miss", stage),
                };
                self.pending = other;
                return Err(BuildError::StageOrder(reason));
            }
        };

        let metadata = CommitMetadata {
            stage_name: pending.stage.clone(),
            cache_key: pending.cache_key.clone(),
        };
        let parent = self.head().map(str::to_string);

        let id = match self.write_and_publish(parent.as_deref(), &metadata, message) {
            Ok(id) => id,
            Err(e) => {
                self.pending = Some(pending);
                return Err(e);
            }
        };

        info!("Committed {} as {}", stage, &id[..12]);
        self.elements.truncate(self.position);
        self.elements.push(Element {
            stage: pending.stage,
            cache_key: pending.cache_key,
            commit: id.clone(),
        });
        self.position += 1;
        self.checked_out = Some(Some(id.clone()));
        Ok(id)
    }

    fn write_and_publish(
        &mut self,
        parent: Option<&str>,
        metadata: &CommitMetadata,
        message: &str,
    ) -> BuildResult<CommitId> {
        self.store.begin_transaction()?;
        let written = self
            .store
            .write_commit(parent, &self.app_dir, metadata, message)
            .and_then(|id| self.store.set_ref(&self.branch, &id).map(|()| id));

        match written {
            Ok(id) => {
                self.store.commit_transaction()?;
                Ok(id)
            }
            Err(e) => {
                self.store.abort_transaction();
                Err(e)
            }
        }
    }
}
