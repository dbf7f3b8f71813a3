use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::{self, DEFAULT_MAX_SIZE, DEFAULT_RETENTION};
use crate::digest::Digest;
use crate::errors::Error;
use crate::events::{event, event_message, event_value};
use crate::glob::GlobList;
use crate::hashing;
use crate::index::Index;
use crate::inode::Inode;
use crate::lockfile::LockFile;
use crate::pool::{pool, WaitGroup};
use crate::remote::Remote;
use crate::status::{FileStatus, FileType};
use crate::tree::{self, TreeEntry};
use crate::walk;

/// The content-addressed object store.
///
/// Objects live under `objects/<hh>/<rest>.file` and `.tree`, sharded by the
/// first two hex characters of their digest. All state is in the filesystem,
/// so the handle is cheap to clone into worker tasks.
#[derive(Clone)]
pub struct Cache {
    object_dir: PathBuf,
    tmp_dir: PathBuf,
    max_size_slice: u64,
    retention: Duration,
    lock: Arc<LockFile>,
}

impl Cache {
    /// Open (creating if needed) a cache rooted at `root`.
    ///
    /// `max_size` bounds the total object size; each of the 256 shards gets
    /// an independent `max_size >> 8` slice of it. `retention` is the minimum
    /// age before eviction may remove an object.
    pub fn new(root: &Path, max_size: u64, retention: Duration) -> Result<Cache> {
        let object_dir = root.join("objects");
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&object_dir).with_context(|| {
            format!(
                "failed to create cache object directory {}",
                object_dir.display()
            )
        })?;
        fs::create_dir_all(&tmp_dir).with_context(|| {
            format!(
                "failed to create cache temporary directory {}",
                tmp_dir.display()
            )
        })?;
        let lock = LockFile::new(&object_dir.join("lock"))?;
        Ok(Cache {
            object_dir,
            tmp_dir,
            max_size_slice: max_size >> 8,
            retention,
            lock: Arc::new(lock),
        })
    }

    /// Open the per-user default cache with default limits.
    pub fn open_default() -> Result<Cache> {
        Cache::new(&config::default_cache_dir()?, DEFAULT_MAX_SIZE, DEFAULT_RETENTION)
    }

    /// Path of a file object.
    pub(crate) fn file_object_path(&self, hash: &Digest) -> PathBuf {
        self.object_path(hash, "file")
    }

    /// Path of a tree object.
    pub(crate) fn tree_object_path(&self, hash: &Digest) -> PathBuf {
        self.object_path(hash, "tree")
    }

    fn object_path(&self, hash: &Digest, kind: &str) -> PathBuf {
        let hex = hash.hexdigest();
        if hex.len() <= 2 {
            // Empty or malformed digest; resolves to a path that never exists.
            return self.object_dir.join(format!("{hex}.{kind}"));
        }
        self.object_dir
            .join(&hex[..2])
            .join(format!("{}.{kind}", &hex[2..]))
    }

    /// Local presence probe for a file object. Opens the object and bumps its
    /// times so recency feeds eviction; a bare existence check would not.
    pub fn has_object(&self, hash: &Digest) -> bool {
        touch(&self.file_object_path(hash))
    }

    /// Local presence probe for a tree object; touches like [`Cache::has_object`].
    pub fn has_tree(&self, hash: &Digest) -> bool {
        touch(&self.tree_object_path(hash))
    }

    /// Ingest an index: every dirty file is rehashed and copied into the
    /// store, every dirty or missing directory gets its tree object
    /// serialized bottom-up, and finally the root. On return the root hash
    /// identifies the snapshot.
    pub fn add(&self, index: &mut Index) -> Result<()> {
        event("cache::add", &index.root_path().display().to_string());
        debug!(root = %index.root_path().display(), entries = index.len(), "cache add");

        let wg = WaitGroup::new();
        let rehashed: Arc<Mutex<Vec<(usize, Digest)>>> = Arc::default();
        let mut pending_dirs: Vec<usize> = Vec::new();

        for (i, node) in index.nodes().iter().enumerate() {
            if node.is_file() {
                let cache = self.clone();
                let root = index.root_path().to_path_buf();
                let node = node.clone();
                let rehashed = Arc::clone(&rehashed);
                let task_wg = wg.clone();
                wg.add(1);
                pool().enqueue(move || {
                    task_wg.finish(cache.ingest_file(&root, node, i, &rehashed));
                });
            } else if node.is_directory() && (node.is_dirty() || !self.has_tree(node.hash())) {
                pending_dirs.push(i);
            }
        }

        wg.wait_result()?;
        for (i, digest) in rehashed.lock().drain(..) {
            index.nodes_mut()[i].set_hash(digest);
        }

        // Reverse encounter order serializes children before their parents,
        // so every child hash is final when its parent tree is written.
        let children = children_map(index);
        for &i in pending_dirs.iter().rev() {
            let label = if index.nodes()[i].is_dirty() {
                "dirty"
            } else {
                "missing"
            };
            event_message("cache::add", index.nodes()[i].path(), label);
            self.create_dirtree(index, &children, Some(i))?;
        }
        self.create_dirtree(index, &children, None)?;

        Ok(())
    }

    fn ingest_file(
        &self,
        root: &Path,
        mut node: Inode,
        i: usize,
        rehashed: &Mutex<Vec<(usize, Digest)>>,
    ) -> Result<()> {
        if node.is_dirty() {
            node.rehash(root)?;
            rehashed.lock().push((i, node.hash().clone()));
            let _guard = self.lock.lock()?;
            if !self.has_object(node.hash()) {
                event_message("cache::add", node.path(), "dirty");
                self.create_file(root, &node)?;
            }
        } else {
            let _guard = self.lock.lock()?;
            if !self.has_object(node.hash()) {
                event_message("cache::add", node.path(), "missing");
                self.create_file(root, &node)?;
            }
        }
        Ok(())
    }

    fn create_file(&self, root: &Path, node: &Inode) -> Result<()> {
        let tmp = NamedTempFile::new_in(&self.tmp_dir)
            .with_context(|| "failed to create temporary file".to_string())?;
        fs::copy(root.join(node.path()), tmp.path())
            .with_context(|| format!("failed to copy file {}", node.path()))?;
        set_object_perms(tmp.path())
            .with_context(|| format!("failed to set file permissions on {}", node.path()))?;

        let object_path = self.file_object_path(node.hash());
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        if let Err(err) = tmp.persist(&object_path) {
            if !object_path.exists() {
                return Err(err).with_context(|| {
                    format!("failed to rename temporary file to {}", object_path.display())
                });
            }
        }
        Ok(())
    }

    /// Serialize one directory's tree object (or the root's when `node_idx`
    /// is `None`) into the store via a temp file rename, and record the
    /// resulting hash on the inode.
    fn create_dirtree(
        &self,
        index: &mut Index,
        children: &HashMap<String, Vec<usize>>,
        node_idx: Option<usize>,
    ) -> Result<()> {
        let dir_path = match node_idx {
            Some(i) => index.nodes()[i].path().to_string(),
            None => String::new(),
        };

        let payload = {
            let nodes = index.nodes();
            let child_refs: Vec<&Inode> = children
                .get(&dir_path)
                .map(|ids| ids.iter().map(|&j| &nodes[j]).collect())
                .unwrap_or_default();
            tree::encode(&child_refs)
        };
        let digest = hashing::hash_bytes(&payload);

        let object_path = self.tree_object_path(&digest);
        if !object_path.exists() {
            let mut tmp = NamedTempFile::new_in(&self.tmp_dir)
                .with_context(|| "failed to create temporary file".to_string())?;
            tmp.write_all(&payload)
                .with_context(|| "failed to write to temporary file".to_string())?;
            if let Some(parent) = object_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
            if let Err(err) = tmp.persist(&object_path) {
                // A concurrent process may have renamed the same tree first.
                if !object_path.exists() {
                    return Err(err).with_context(|| {
                        format!("failed to rename temporary file to {}", object_path.display())
                    });
                }
            }
        }

        match node_idx {
            Some(i) => index.nodes_mut()[i].set_hash(digest),
            None => index.root_mut().set_hash(digest),
        }
        Ok(())
    }

    /// Read and decode a locally cached tree object.
    pub fn read_tree(&self, hash: &Digest) -> Result<Vec<TreeEntry>> {
        let object = self.tree_object_path(hash);
        let file = File::open(&object)
            .map_err(|_| Error::NotFound(format!("tree object {hash} in local cache")))?;
        tree::decode(BufReader::new(file), &format!("tree object {hash}"))
    }

    /// Inflate an index from a root tree hash by reading cached tree objects
    /// breadth-first, one parallel wave per depth. Entries are appended
    /// unsorted; callers sort before merge-based use.
    pub fn index_from_tree(&self, tree_hash: &Digest, index: &mut Index) -> Result<()> {
        index.root_mut().set_hash(tree_hash.clone());
        index
            .root_mut()
            .set_status(FileStatus::new(FileType::Directory, 0));

        let mut frontier: Vec<(String, Digest)> = vec![(String::new(), tree_hash.clone())];
        while !frontier.is_empty() {
            let wg = WaitGroup::new();
            let collected: Arc<Mutex<Vec<Inode>>> = Arc::default();
            let next: Arc<Mutex<Vec<(String, Digest)>>> = Arc::default();

            for (dir_path, hash) in frontier.drain(..) {
                let cache = self.clone();
                let collected = Arc::clone(&collected);
                let next = Arc::clone(&next);
                let task_wg = wg.clone();
                wg.add(1);
                pool().enqueue(move || {
                    task_wg.finish(cache.inflate_tree(&dir_path, &hash, &collected, &next));
                });
            }

            wg.wait_result()?;
            index.extend(collected.lock().drain(..));
            frontier = std::mem::take(&mut *next.lock());
        }
        Ok(())
    }

    fn inflate_tree(
        &self,
        dir_path: &str,
        hash: &Digest,
        collected: &Mutex<Vec<Inode>>,
        next: &Mutex<Vec<(String, Digest)>>,
    ) -> Result<()> {
        for entry in self.read_tree(hash)? {
            let path = join_rel(dir_path, &entry.name);
            let node = Inode::new(path.clone(), entry.status, 0, 0, entry.target, entry.hash);
            if node.is_directory() {
                next.lock().push((path, node.hash().clone()));
            }
            collected.lock().push(node);
        }
        Ok(())
    }

    /// Fetch a file object from the remote unless already present locally.
    pub fn pull_object(&self, remote: &Arc<dyn Remote>, hash: &Digest) -> Result<()> {
        let _guard = self.lock.lock()?;
        if !self.has_object(hash) {
            event("cache::pull_object", &hash.to_string());
            remote.read_object(hash, &self.file_object_path(hash), &self.tmp_dir)?;
        }
        Ok(())
    }

    /// Fetch a tree object from the remote unless already present locally.
    pub fn pull_tree(&self, remote: &Arc<dyn Remote>, hash: &Digest) -> Result<()> {
        let _guard = self.lock.lock()?;
        if !self.has_tree(hash) {
            event("cache::pull_tree", &hash.to_string());
            remote.read_object(hash, &self.tree_object_path(hash), &self.tmp_dir)?;
        }
        Ok(())
    }

    fn push_object(&self, remote: &Arc<dyn Remote>, hash: &Digest) -> Result<()> {
        event("cache::push_object", &hash.to_string());
        remote.write_object(hash, &self.file_object_path(hash))
    }

    fn push_tree(&self, remote: &Arc<dyn Remote>, hash: &Digest) -> Result<()> {
        event("cache::push_tree", &hash.to_string());
        remote.write_object(hash, &self.tree_object_path(hash))
    }

    /// Upload a snapshot. Trees are probed depth-first through the remote's
    /// `has_tree` capability, which prunes any subtree whose tree object the
    /// remote already has; without the capability, the whole index is batch
    /// probed per wave. Uploads fan out in parallel; each uploaded tree is
    /// pushed back onto the work list for its own probe.
    pub fn push(&self, index: &Index, remote: &Arc<dyn Remote>) -> Result<()> {
        event_value(
            "cache::push",
            &index.root().hash().to_string(),
            index.len() as u64,
        );
        debug!(root = %index.root().hash(), entries = index.len(), "cache push");

        let wg = WaitGroup::new();
        let work: Arc<Mutex<Vec<Digest>>> = Arc::new(Mutex::new(vec![index.root().hash().clone()]));

        loop {
            let tree_hash = match work.lock().pop() {
                Some(hash) => hash,
                None => break,
            };

            let (missing_trees, missing_objects) = match remote.has_tree(&tree_hash) {
                Ok(missing) => missing,
                Err(err) if Error::is_unsupported(&err) => {
                    probe_whole_index(index, remote, &tree_hash)?
                }
                Err(err) => return Err(err),
            };

            for hash in missing_objects {
                event("cache::remote_missing_object", &hash.to_string());
                let cache = self.clone();
                let remote = Arc::clone(remote);
                let task_wg = wg.clone();
                wg.add(1);
                pool().enqueue(move || {
                    task_wg.finish(cache.push_object(&remote, &hash));
                });
            }

            for hash in missing_trees {
                event("cache::remote_missing_tree", &hash.to_string());
                let cache = self.clone();
                let remote = Arc::clone(remote);
                let work = Arc::clone(&work);
                let task_wg = wg.clone();
                wg.add(1);
                pool().enqueue(move || {
                    let result = cache.push_tree(&remote, &hash).map(|()| {
                        work.lock().push(hash);
                    });
                    task_wg.finish(result);
                });
            }

            if work.lock().is_empty() {
                wg.wait_result()?;
            }
        }

        Ok(())
    }

    /// Download the snapshot named by `tree_hash`, populating `index` along
    /// the way. Trees are fetched breadth-first; each wave materializes its
    /// tree objects, then fetches the file objects they reference, then
    /// advances to the child directories. Symlinks contribute no objects.
    pub fn pull(
        &self,
        index: &mut Index,
        remote: &Arc<dyn Remote>,
        tree_hash: &Digest,
    ) -> Result<()> {
        event_value("cache::pull", &tree_hash.to_string(), index.len() as u64);
        debug!(root = %tree_hash, "cache pull");

        index.root_mut().set_hash(tree_hash.clone());
        index
            .root_mut()
            .set_status(FileStatus::new(FileType::Directory, 0));

        let mut frontier: Vec<(String, Digest)> = vec![(String::new(), tree_hash.clone())];
        while !frontier.is_empty() {
            let wg = WaitGroup::new();

            for (_, hash) in &frontier {
                let cache = self.clone();
                let remote = Arc::clone(remote);
                let hash = hash.clone();
                let task_wg = wg.clone();
                wg.add(1);
                pool().enqueue(move || {
                    task_wg.finish(cache.pull_tree(&remote, &hash));
                });
            }
            wg.wait_result()?;

            let collected: Arc<Mutex<Vec<Inode>>> = Arc::default();
            let next: Arc<Mutex<Vec<(String, Digest)>>> = Arc::default();

            for (dir_path, hash) in frontier.drain(..) {
                let cache = self.clone();
                let remote = Arc::clone(remote);
                let collected = Arc::clone(&collected);
                let next = Arc::clone(&next);
                let task_wg = wg.clone();
                wg.add(1);
                pool().enqueue(move || {
                    let result = cache.pull_tree_children(&remote, &dir_path, &hash, &collected, &next, &task_wg);
                    task_wg.finish(result);
                });
            }
            wg.wait_result()?;

            index.extend(collected.lock().drain(..));
            frontier = std::mem::take(&mut *next.lock());
        }
        Ok(())
    }

    fn pull_tree_children(
        &self,
        remote: &Arc<dyn Remote>,
        dir_path: &str,
        hash: &Digest,
        collected: &Mutex<Vec<Inode>>,
        next: &Mutex<Vec<(String, Digest)>>,
        wg: &WaitGroup,
    ) -> Result<()> {
        for entry in self.read_tree(hash)? {
            let path = join_rel(dir_path, &entry.name);
            let node = Inode::new(path.clone(), entry.status, 0, 0, entry.target, entry.hash);
            let is_dir = node.is_directory();
            let is_symlink = node.is_symlink();
            let child_hash = node.hash().clone();
            collected.lock().push(node);

            if is_symlink {
                continue;
            }
            if is_dir {
                next.lock().push((path, child_hash));
                continue;
            }

            let cache = self.clone();
            let remote = Arc::clone(remote);
            let task_wg = wg.clone();
            wg.add(1);
            pool().enqueue(move || {
                task_wg.finish(cache.pull_object(&remote, &child_hash));
            });
        }
        Ok(())
    }

    /// Copy a cached file object to `to`, with the object's bytes verbatim.
    pub fn copy_file(&self, hash: &Digest, to: &Path) -> Result<()> {
        fs::copy(self.file_object_path(hash), to)
            .with_context(|| format!("failed to copy object {hash} to {}", to.display()))?;
        Ok(())
    }

    /// Shrink each shard toward its slice of the size budget, oldest objects
    /// first, never touching anything younger than the retention period.
    /// Shards evict in parallel; removals are serialized by the lock and
    /// tolerate objects concurrently removed by other processes.
    pub fn evict(&self) -> Result<()> {
        let wg = WaitGroup::new();
        let listing = walk::walk_with(&self.object_dir, &GlobList::new(), false, |a, b| {
            a.path().cmp(b.path())
        })?;

        for node in listing.entries {
            if !node.is_directory() {
                continue;
            }
            let cache = self.clone();
            let task_wg = wg.clone();
            wg.add(1);
            pool().enqueue(move || {
                let dir = cache.object_dir.join(node.path());
                task_wg.finish(cache.evict_shard(&dir));
            });
        }

        wg.wait_result()
    }

    fn evict_shard(&self, dir: &Path) -> Result<()> {
        let listing = walk::walk_with(dir, &GlobList::new(), false, |a, b| {
            a.mtime().cmp(&b.mtime())
        })?;

        let mut size: u64 = listing.entries.iter().map(Inode::size).sum();
        let retention_ns = self.retention.as_nanos() as i64;

        for node in &listing.entries {
            if size < self.max_size_slice {
                break;
            }

            let _guard = self.lock.lock()?;
            let full = dir.join(node.path());

            // Re-stat with the lock held: another process may have removed or
            // refreshed the object since the listing.
            let meta = match fs::symlink_metadata(&full) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);
            if walk::mtime_ns(&meta) + retention_ns > now {
                continue;
            }

            fs::remove_file(&full)
                .with_context(|| format!("failed to remove cache object {}", full.display()))?;
            size = size.saturating_sub(node.size());
            event("cache::evict", &full.display().to_string());
        }
        Ok(())
    }
}

/// Batch fallback when the remote lacks `has_tree`: probe the root tree and
/// every hashed inode in one `has_objects` round trip and partition the
/// absentees into trees and file objects. Symlinks have no objects to probe.
fn probe_whole_index(
    index: &Index,
    remote: &Arc<dyn Remote>,
    tree_hash: &Digest,
) -> Result<(Vec<Digest>, Vec<Digest>)> {
    let mut hashes = vec![tree_hash.clone()];
    let mut is_tree = vec![true];
    for node in index.iter() {
        if node.is_symlink() || node.hash().is_empty() {
            continue;
        }
        hashes.push(node.hash().clone());
        is_tree.push(node.is_directory());
    }

    let presence = remote.has_objects(&hashes)?;
    let mut missing_trees = Vec::new();
    let mut missing_objects = Vec::new();
    for ((hash, tree), present) in hashes.into_iter().zip(is_tree).zip(presence) {
        if present {
            continue;
        }
        if tree {
            missing_trees.push(hash);
        } else {
            missing_objects.push(hash);
        }
    }
    Ok((missing_trees, missing_objects))
}

fn children_map(index: &Index) -> HashMap<String, Vec<usize>> {
    let mut map: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, node) in index.nodes().iter().enumerate() {
        map.entry(node.parent_path().to_string()).or_default().push(i);
    }
    map
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Open the file for writing and bump its access and modification times.
/// False when absent or unopenable. This doubles as the presence probe so
/// that every hit refreshes the object's standing with the eviction scan.
fn touch(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().append(true).open(path) else {
        return false;
    };
    let now = filetime::FileTime::now();
    filetime::set_file_handle_times(&file, Some(now), Some(now)).is_ok()
}

#[cfg(unix)]
fn set_object_perms(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_object_perms(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_are_sharded_by_hex_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), DEFAULT_MAX_SIZE, DEFAULT_RETENTION).unwrap();
        let digest = hashing::hash_bytes(b"shard me");
        let hex = digest.hexdigest().to_string();

        let file = cache.file_object_path(&digest);
        assert!(file.ends_with(format!("{}/{}.file", &hex[..2], &hex[2..])));
        let tree = cache.tree_object_path(&digest);
        assert!(tree.ends_with(format!("{}/{}.tree", &hex[..2], &hex[2..])));
    }

    #[test]
    fn touch_probe_updates_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object");
        fs::write(&path, b"x").unwrap();
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_times(&path, old, old).unwrap();

        assert!(touch(&path));
        let meta = fs::metadata(&path).unwrap();
        assert!(filetime::FileTime::from_last_modification_time(&meta) > old);

        assert!(!touch(&dir.path().join("missing")));
    }

    #[test]
    fn children_map_groups_by_parent() {
        let mut index = Index::new(Path::new("/tmp/unused"));
        for path in ["a", "a/x", "a/y", "b"] {
            index.push(Inode::new(
                path.to_string(),
                FileStatus::new(FileType::Regular, 0o644),
                0,
                0,
                String::new(),
                Digest::none(),
            ));
        }
        let map = children_map(&index);
        assert_eq!(map[""], vec![0, 3]);
        assert_eq!(map["a"], vec![1, 2]);
    }
}
