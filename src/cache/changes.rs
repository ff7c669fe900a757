//! Change sets between cache commits
//!
//! Both queries compare committed snapshots, never the live app directory.

use super::BuildCache;
use crate::error::BuildResult;
use crate::store::Change;

impl BuildCache {
    /// Paths changed by the stage at the current position
    ///
    /// Compares the head commit with its parent (or the empty tree for the
    /// first stage). Empty when no stage has been confirmed yet.
    pub fn changes_since_last_stage(&self) -> BuildResult<Vec<Change>> {
        let Some(head) = self.head() else {
            return Ok(Vec::new());
        };
        let parent = self.store().load_commit(head)?.parent;
        self.store().diff(parent.as_deref(), Some(head))
    }

    /// Paths changed between the branch tip at open and the current head
    pub fn changes_since_session_start(&self) -> BuildResult<Vec<Change>> {
        let head = self.head();
        if head == self.session_start() {
            return Ok(Vec::new());
        }
        self.store().diff(self.session_start(), head)
    }
}
