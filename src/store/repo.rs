//! Filesystem-backed commit store

use crate::error::{BuildError, BuildResult};
use crate::store::object::{
    decode, is_object_id, object_id, CommitObject, DirTree, Node, ObjectKind, TreeEntry,
};
use crate::store::{Change, ChangeKind, CommitId, CommitInfo, CommitMetadata, CommitStore, PruneStats};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

const CONFIG_FILE: &str = "config";
const OBJECTS_DIR: &str = "objects";
const REFS_DIR: &str = "refs/heads";
const TMP_DIR: &str = "tmp";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RepoConfig {
    #[serde(rename = "format-version")]
    format_version: u32,
}

/// Content-addressed snapshot store rooted at a directory
#[derive(Debug)]
pub struct FsRepo {
    root: PathBuf,
    /// Ref updates staged by the open transaction, if any
    pending: Option<BTreeMap<String, CommitId>>,
}

impl FsRepo {
    /// Open the store at `root`, creating its layout on first use
    pub fn open_or_init(root: &Path) -> BuildResult<Self> {
        for dir in [OBJECTS_DIR, REFS_DIR, TMP_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| BuildError::store_io("creating store layout", &path, e))?;
        }

        let config_path = root.join(CONFIG_FILE);
        let repo = Self {
            root: root.to_path_buf(),
            pending: None,
        };

        match fs::read(&config_path) {
            Ok(bytes) => {
                let config: RepoConfig = decode(CONFIG_FILE, &bytes)?;
                if config.format_version != FORMAT_VERSION {
                    return Err(BuildError::corrupt(
                        CONFIG_FILE,
                        format!(
                            "unsupported format version {} (expected {})",
                            config.format_version, FORMAT_VERSION
                        ),
                    ));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let config = RepoConfig {
                    format_version: FORMAT_VERSION,
                };
                repo.write_atomic(&config_path, &serde_json::to_vec_pretty(&config)?)?;
                info!("Initialized store at {}", root.display());
            }
            Err(e) => return Err(BuildError::store_io("reading store config", &config_path, e)),
        }

        repo.clear_tmp()?;
        Ok(repo)
    }

    /// Leftovers in tmp/ are from interrupted writes and never referenced
    fn clear_tmp(&self) -> BuildResult<()> {
        let tmp = self.root.join(TMP_DIR);
        let entries =
            fs::read_dir(&tmp).map_err(|e| BuildError::store_io("listing tmp", &tmp, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BuildError::store_io("listing tmp", &tmp, e))?;
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|e| BuildError::store_io("clearing tmp", &path, e))?;
        }
        Ok(())
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> BuildResult<()> {
        let tmp = self.root.join(TMP_DIR).join(Uuid::new_v4().to_string());
        fs::write(&tmp, bytes).map_err(|e| BuildError::store_io("writing", &tmp, e))?;
        fs::rename(&tmp, dest).map_err(|e| BuildError::store_io("renaming into place", dest, e))
    }

    fn object_path(&self, kind: ObjectKind, id: &str) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(&id[..2])
            .join(format!("{}.{}", &id[2..], kind.suffix()))
    }

    fn ref_path(&self, branch: &str) -> PathBuf {
        self.root.join(REFS_DIR).join(branch)
    }

    fn write_object(&self, kind: ObjectKind, bytes: &[u8]) -> BuildResult<String> {
        let id = object_id(bytes);
        let path = self.object_path(kind, &id);
        if path.exists() {
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BuildError::store_io("creating object directory", parent, e))?;
        }
        self.write_atomic(&path, bytes)?;
        Ok(id)
    }

    fn read_object(&self, kind: ObjectKind, id: &str) -> BuildResult<Vec<u8>> {
        if !is_object_id(id) {
            return Err(BuildError::corrupt(id, "malformed object id"));
        }
        let path = self.object_path(kind, id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BuildError::corrupt(
                    id,
                    format!("missing {} object", kind.suffix()),
                ))
            }
            Err(e) => return Err(BuildError::store_io("reading object", &path, e)),
        };
        let actual = object_id(&bytes);
        if actual != id {
            return Err(BuildError::corrupt(
                id,
                format!("content hashes to {}", actual),
            ));
        }
        Ok(bytes)
    }

    fn read_tree(&self, id: &str) -> BuildResult<DirTree> {
        let bytes = self.read_object(ObjectKind::DirTree, id)?;
        decode(id, &bytes)
    }

    fn read_commit(&self, id: &str) -> BuildResult<CommitObject> {
        let bytes = self.read_object(ObjectKind::Commit, id)?;
        decode(id, &bytes)
    }

    /// Recursively store a directory, returning its tree id
    fn write_tree(&self, dir: &Path) -> BuildResult<String> {
        let mut entries = Vec::new();
        let listing =
            fs::read_dir(dir).map_err(|e| BuildError::store_io("listing directory", dir, e))?;

        for entry in listing {
            let entry = entry.map_err(|e| BuildError::store_io("listing directory", dir, e))?;
            let path = entry.path();
            let name = entry.file_name().into_string().map_err(|raw| {
                BuildError::store_io(
                    "reading file name",
                    dir.join(&raw),
                    std::io::Error::new(ErrorKind::InvalidData, "file name is not UTF-8"),
                )
            })?;
            let meta = fs::symlink_metadata(&path)
                .map_err(|e| BuildError::store_io("reading metadata", &path, e))?;
            let file_type = meta.file_type();

            let node = if file_type.is_symlink() {
                let target = fs::read_link(&path)
                    .map_err(|e| BuildError::store_io("reading symlink", &path, e))?;
                Node::Symlink {
                    target: target.to_string_lossy().into_owned(),
                }
            } else if file_type.is_dir() {
                Node::Dir {
                    id: self.write_tree(&path)?,
                }
            } else if file_type.is_file() {
                let contents =
                    fs::read(&path).map_err(|e| BuildError::store_io("reading file", &path, e))?;
                Node::File {
                    id: self.write_object(ObjectKind::File, &contents)?,
                    mode: file_mode(&meta),
                }
            } else {
                debug!("Skipping special file {}", path.display());
                continue;
            };

            entries.push(TreeEntry { name, node });
        }

        let tree = DirTree::new(entries);
        self.write_object(ObjectKind::DirTree, &serde_json::to_vec(&tree)?)
    }

    fn commit_tree(&self, commit: Option<&str>) -> BuildResult<DirTree> {
        match commit {
            Some(id) => {
                let commit = self.read_commit(id)?;
                self.read_tree(&commit.tree)
            }
            None => Ok(DirTree::default()),
        }
    }

    fn diff_trees(
        &self,
        prefix: &str,
        old: &DirTree,
        new: &DirTree,
        out: &mut Vec<Change>,
    ) -> BuildResult<()> {
        let names: BTreeSet<&str> = old
            .entries
            .iter()
            .chain(new.entries.iter())
            .map(|e| e.name.as_str())
            .collect();

        for name in names {
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", prefix, name)
            };

            match (old.get(name), new.get(name)) {
                (Some(_), None) => out.push(Change::new(path, ChangeKind::Removed)),
                (None, Some(_)) => out.push(Change::new(path, ChangeKind::Added)),
                (Some(Node::Dir { id: a }), Some(Node::Dir { id: b })) => {
                    if a != b {
                        let (a, b) = (self.read_tree(a)?, self.read_tree(b)?);
                        self.diff_trees(&path, &a, &b, out)?;
                    }
                }
                (Some(a), Some(b)) if a.same_kind(b) => {
                    if a != b {
                        out.push(Change::new(path, ChangeKind::Modified));
                    }
                }
                (Some(_), Some(_)) => {
                    out.push(Change::new(path.clone(), ChangeKind::Removed));
                    out.push(Change::new(path, ChangeKind::Added));
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    fn checkout_tree(&self, tree: &DirTree, dest: &Path) -> BuildResult<()> {
        for entry in &tree.entries {
            let path = dest.join(&entry.name);
            match &entry.node {
                Node::Dir { id } => {
                    fs::create_dir(&path)
                        .map_err(|e| BuildError::store_io("creating directory", &path, e))?;
                    let subtree = self.read_tree(id)?;
                    self.checkout_tree(&subtree, &path)?;
                }
                Node::File { id, mode } => {
                    if !is_object_id(id) {
                        return Err(BuildError::corrupt(id.as_str(), "malformed file id in tree"));
                    }
                    let src = self.object_path(ObjectKind::File, id);
                    fs::copy(&src, &path)
                        .map_err(|e| BuildError::store_io("checking out file", &path, e))?;
                    set_file_mode(&path, *mode)?;
                }
                Node::Symlink { target } => {
                    make_symlink(target, &path)?;
                }
            }
        }
        Ok(())
    }

    fn mark_tree(&self, id: &str, live: &mut HashSet<(ObjectKind, String)>) -> BuildResult<()> {
        if !live.insert((ObjectKind::DirTree, id.to_string())) {
            return Ok(());
        }
        let tree = self.read_tree(id)?;
        for entry in &tree.entries {
            match &entry.node {
                Node::Dir { id } => self.mark_tree(id, live)?,
                Node::File { id, .. } => {
                    live.insert((ObjectKind::File, id.clone()));
                }
                Node::Symlink { .. } => {}
            }
        }
        Ok(())
    }
}

impl CommitStore for FsRepo {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_ref(&self, branch: &str) -> BuildResult<Option<CommitId>> {
        validate_branch(branch)?;
        let path = self.ref_path(branch);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let id = content.trim();
                if !is_object_id(id) {
                    return Err(BuildError::corrupt(
                        format!("refs/heads/{}", branch),
                        "ref does not contain a commit id",
                    ));
                }
                Ok(Some(id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::store_io("reading ref", &path, e)),
        }
    }

    fn begin_transaction(&mut self) -> BuildResult<()> {
        if self.pending.is_some() {
            return Err(BuildError::TransactionActive);
        }
        self.pending = Some(BTreeMap::new());
        Ok(())
    }

    fn commit_transaction(&mut self) -> BuildResult<()> {
        let pending = self.pending.take().ok_or(BuildError::NoTransaction)?;
        for (branch, commit) in pending {
            self.write_atomic(&self.ref_path(&branch), format!("{}\n", commit).as_bytes())?;
            debug!("Ref {} -> {}", branch, commit);
        }
        Ok(())
    }

    fn abort_transaction(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Aborted transaction with {} staged ref update(s)", pending.len());
        }
    }

    fn write_commit(
        &mut self,
        parent: Option<&str>,
        dir: &Path,
        metadata: &CommitMetadata,
        subject: &str,
    ) -> BuildResult<CommitId> {
        if let Some(parent) = parent {
            self.read_commit(parent)?;
        }
        let tree = self.write_tree(dir)?;
        let commit = CommitObject {
            parent: parent.map(str::to_string),
            tree,
            subject: subject.to_string(),
            metadata: metadata.clone(),
            timestamp: Utc::now(),
        };
        self.write_object(ObjectKind::Commit, &serde_json::to_vec(&commit)?)
    }

    fn set_ref(&mut self, branch: &str, commit: &str) -> BuildResult<()> {
        validate_branch(branch)?;
        let pending = self.pending.as_mut().ok_or(BuildError::NoTransaction)?;
        pending.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    fn load_commit(&self, id: &str) -> BuildResult<CommitInfo> {
        let commit = self.read_commit(id)?;
        Ok(CommitInfo {
            id: id.to_string(),
            parent: commit.parent,
            subject: commit.subject,
            metadata: commit.metadata,
            timestamp: commit.timestamp,
        })
    }

    fn diff(&self, from: Option<&str>, to: Option<&str>) -> BuildResult<Vec<Change>> {
        let old = self.commit_tree(from)?;
        let new = self.commit_tree(to)?;
        let mut changes = Vec::new();
        self.diff_trees("", &old, &new, &mut changes)?;
        // Stable sort keeps a removal ahead of the re-add at the same path
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn checkout(&self, commit: &str, dest: &Path) -> BuildResult<()> {
        if dest.exists() {
            let mut listing = fs::read_dir(dest)
                .map_err(|e| BuildError::store_io("listing checkout destination", dest, e))?;
            if listing.next().is_some() {
                return Err(BuildError::CheckoutNotEmpty(dest.to_path_buf()));
            }
        } else {
            fs::create_dir_all(dest)
                .map_err(|e| BuildError::store_io("creating checkout destination", dest, e))?;
        }

        let tree = self.commit_tree(Some(commit))?;
        self.checkout_tree(&tree, dest)?;
        debug!("Checked out {} to {}", &commit[..12], dest.display());
        Ok(())
    }

    fn list_refs(&self) -> BuildResult<Vec<String>> {
        let dir = self.root.join(REFS_DIR);
        let listing =
            fs::read_dir(&dir).map_err(|e| BuildError::store_io("listing refs", &dir, e))?;
        let mut refs = Vec::new();
        for entry in listing {
            let entry = entry.map_err(|e| BuildError::store_io("listing refs", &dir, e))?;
            if let Ok(name) = entry.file_name().into_string() {
                refs.push(name);
            }
        }
        refs.sort();
        Ok(refs)
    }

    fn delete_ref(&mut self, branch: &str) -> BuildResult<()> {
        validate_branch(branch)?;
        let path = self.ref_path(branch);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted ref {}", branch);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::store_io("deleting ref", &path, e)),
        }
    }

    fn prune_unreferenced(&mut self) -> BuildResult<PruneStats> {
        if self.pending.is_some() {
            return Err(BuildError::TransactionActive);
        }

        let mut live: HashSet<(ObjectKind, String)> = HashSet::new();
        for branch in self.list_refs()? {
            let mut next = self.resolve_ref(&branch)?;
            while let Some(id) = next {
                if !live.insert((ObjectKind::Commit, id.clone())) {
                    break;
                }
                let commit = self.read_commit(&id)?;
                self.mark_tree(&commit.tree, &mut live)?;
                next = commit.parent;
            }
        }

        let mut stats = PruneStats::default();
        let objects = self.root.join(OBJECTS_DIR);
        let fanout =
            fs::read_dir(&objects).map_err(|e| BuildError::store_io("listing objects", &objects, e))?;

        for bucket in fanout {
            let bucket = bucket.map_err(|e| BuildError::store_io("listing objects", &objects, e))?;
            let bucket_path = bucket.path();
            let prefix = bucket.file_name().to_string_lossy().into_owned();
            let listing = fs::read_dir(&bucket_path)
                .map_err(|e| BuildError::store_io("listing objects", &bucket_path, e))?;

            for entry in listing {
                let entry =
                    entry.map_err(|e| BuildError::store_io("listing objects", &bucket_path, e))?;
                let path = entry.path();
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some((rest, suffix)) = file_name.split_once('.') else {
                    continue;
                };
                let Some(kind) = ObjectKind::from_suffix(suffix) else {
                    continue;
                };

                stats.objects_total += 1;
                let id = format!("{}{}", prefix, rest);
                if live.contains(&(kind, id)) {
                    continue;
                }

                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                fs::remove_file(&path)
                    .map_err(|e| BuildError::store_io("pruning object", &path, e))?;
                stats.objects_pruned += 1;
                stats.bytes_freed += size;
            }

            // Empty fan-out directories are harmless; ignore failures
            let _ = fs::remove_dir(&bucket_path);
        }

        info!(
            "Pruned {} of {} objects ({} bytes)",
            stats.objects_pruned, stats.objects_total, stats.bytes_freed
        );
        Ok(stats)
    }
}

/// Reject branch names that are not a single safe path component
fn validate_branch(name: &str) -> BuildResult<()> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.starts_with('.') {
        Some("starts with '.'")
    } else if name.contains('/') || name.contains('\\') {
        Some("contains a path separator")
    } else if name.contains('\0') || name.chars().any(char::is_whitespace) {
        Some("contains NUL or whitespace")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(BuildError::InvalidBranch {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> BuildResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| BuildError::store_io("setting file mode", path, e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> BuildResult<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path) -> BuildResult<()> {
    std::os::unix::fs::symlink(target, path)
        .map_err(|e| BuildError::store_io("creating symlink", path, e))
}

#[cfg(not(unix))]
fn make_symlink(target: &str, path: &Path) -> BuildResult<()> {
    fs::write(path, target).map_err(|e| BuildError::store_io("writing symlink stand-in", path, e))
}
