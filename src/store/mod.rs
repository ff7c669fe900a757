//! Versioned directory snapshot store
//!
//! The build cache only talks to the store through the [`CommitStore`]
//! trait. [`FsRepo`] is the on-disk implementation: a content-addressed
//! object directory plus one ref file per branch.
//!
//! # Layout
//!
//! ```text
//! <root>/config                         format version
//! <root>/objects/ab/cdef….file          raw file contents
//! <root>/objects/ab/cdef….dirtree       JSON directory listing
//! <root>/objects/ab/cdef….commit        JSON commit (parent, tree, metadata)
//! <root>/refs/heads/<branch>            commit id of the branch tip
//! <root>/tmp/                           staging for atomic renames
//! ```

mod object;
mod repo;

pub use object::CommitMetadata;
pub use repo::FsRepo;

use crate::error::BuildResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Hex SHA256 id of a commit object
pub type CommitId = String;

/// A commit as read back from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub id: CommitId,
    pub parent: Option<CommitId>,
    pub subject: String,
    pub metadata: CommitMetadata,
    pub timestamp: DateTime<Utc>,
}

/// Kind of change reported by a tree diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "A"),
            Self::Removed => write!(f, "D"),
            Self::Modified => write!(f, "M"),
        }
    }
}

/// One changed path, relative to the tree root with forward slashes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
}

impl Change {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Statistics from a prune pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Objects present before pruning
    pub objects_total: usize,
    /// Objects removed
    pub objects_pruned: usize,
    /// Bytes reclaimed
    pub bytes_freed: u64,
}

/// Snapshot store interface used by the build cache
///
/// Missing refs are `Ok(None)`, never an error. Ref updates made with
/// [`CommitStore::set_ref`] only become visible on
/// [`CommitStore::commit_transaction`].
pub trait CommitStore: Send {
    /// Root directory of the store
    fn root(&self) -> &Path;

    /// Resolve a branch to its tip commit
    fn resolve_ref(&self, branch: &str) -> BuildResult<Option<CommitId>>;

    /// Start staging ref updates
    fn begin_transaction(&mut self) -> BuildResult<()>;

    /// Apply all staged ref updates
    fn commit_transaction(&mut self) -> BuildResult<()>;

    /// Discard all staged ref updates
    fn abort_transaction(&mut self);

    /// Snapshot `dir` as a new commit on top of `parent`. Does not move any ref.
    fn write_commit(
        &mut self,
        parent: Option<&str>,
        dir: &Path,
        metadata: &CommitMetadata,
        subject: &str,
    ) -> BuildResult<CommitId>;

    /// Stage a ref update inside the current transaction
    fn set_ref(&mut self, branch: &str, commit: &str) -> BuildResult<()>;

    /// Read a commit's parent link and annotations
    fn load_commit(&self, id: &str) -> BuildResult<CommitInfo>;

    /// Changed paths between two commits; `None` stands for the empty tree
    fn diff(&self, from: Option<&str>, to: Option<&str>) -> BuildResult<Vec<Change>>;

    /// Materialize a commit's tree into `dest`, which must be absent or empty
    fn checkout(&self, commit: &str, dest: &Path) -> BuildResult<()>;

    /// All branch names, sorted
    fn list_refs(&self) -> BuildResult<Vec<String>>;

    /// Remove a branch ref. Removing a missing ref is not an error.
    fn delete_ref(&mut self, branch: &str) -> BuildResult<()>;

    /// Remove every object not reachable from a remaining ref
    fn prune_unreferenced(&mut self) -> BuildResult<PruneStats>;

    /// Commits from `tip` back to the root, newest first
    fn log(&self, tip: &str) -> BuildResult<Vec<CommitInfo>> {
        let mut commits = Vec::new();
        let mut next = Some(tip.to_string());
        while let Some(id) = next {
            let info = self.load_commit(&id)?;
            next = info.parent.clone();
            commits.push(info);
        }
        Ok(commits)
    }
}
