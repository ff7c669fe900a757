//! On-disk object encodings
//!
//! Object ids are the hex SHA256 of the stored bytes, so identical content
//! is stored once and every read can be verified against its id.

use crate::error::{BuildError, BuildResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stage annotations recorded on every cache commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    #[serde(rename = "stage-name")]
    pub stage_name: String,
    #[serde(rename = "cache-key")]
    pub cache_key: String,
}

/// Object kinds, each stored with its own file suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ObjectKind {
    File,
    DirTree,
    Commit,
}

impl ObjectKind {
    pub(crate) fn suffix(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::DirTree => "dirtree",
            Self::Commit => "commit",
        }
    }

    pub(crate) fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "dirtree" => Some(Self::DirTree),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

/// A node in a directory tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum Node {
    File { id: String, mode: u32 },
    Dir { id: String },
    Symlink { target: String },
}

impl Node {
    /// Whether two nodes are the same kind of filesystem entry
    pub(crate) fn same_kind(&self, other: &Node) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TreeEntry {
    pub name: String,
    #[serde(flatten)]
    pub node: Node,
}

/// Directory listing; entries are kept sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DirTree {
    pub entries: Vec<TreeEntry>,
}

impl DirTree {
    pub(crate) fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Node> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i].node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommitObject {
    pub parent: Option<String>,
    pub tree: String,
    pub subject: String,
    pub metadata: CommitMetadata,
    pub timestamp: DateTime<Utc>,
}

/// Hex SHA256 of an object's bytes
pub(crate) fn object_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether a string looks like an object id
pub(crate) fn is_object_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(id: &str, bytes: &[u8]) -> BuildResult<T> {
    serde_json::from_slice(bytes).map_err(|e| BuildError::corrupt(id, e.to_string()))
}
