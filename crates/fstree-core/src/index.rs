use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::cache::Cache;
use crate::digest::{Algorithm, Digest};
use crate::errors::Error;
use crate::events::event;
use crate::glob::GlobList;
use crate::inode::Inode;
use crate::status::FileStatus;
use crate::tree::{read_i64, read_string, read_u16, read_u32, try_read_string};
use crate::walk::{self, mtime_ns};

const INDEX_MAGIC: u16 = 0x3ee3;
const INDEX_VERSION: u16 = 1;

/// A directory snapshot: a flat list of inodes strictly sorted by relative
/// path, plus the root sentinel whose hash identifies the whole tree.
#[derive(Debug, Default)]
pub struct Index {
    root_path: PathBuf,
    root: Inode,
    entries: Vec<Inode>,
    ignores: GlobList,
}

impl Index {
    pub fn new(root_path: &Path) -> Index {
        Index {
            root_path: root_path.to_path_buf(),
            root: Inode::root(),
            entries: Vec::new(),
            ignores: GlobList::new(),
        }
    }

    pub fn with_ignores(root_path: &Path, ignores: GlobList) -> Index {
        Index {
            ignores,
            ..Index::new(root_path)
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn root(&self) -> &Inode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Inode {
        &mut self.root
    }

    pub fn nodes(&self) -> &[Inode] {
        &self.entries
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Inode] {
        &mut self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Inode> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, node: Inode) {
        self.entries.push(node);
    }

    pub(crate) fn extend(&mut self, nodes: impl IntoIterator<Item = Inode>) {
        self.entries.extend(nodes);
    }

    /// Sort entries by path. Pull and tree inflation append unordered; call
    /// this before any merge-based operation.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.path().cmp(b.path()));
    }

    /// Binary search for an exact relative path.
    pub fn find_node_by_path(&self, path: &str) -> Option<&Inode> {
        self.entries
            .binary_search_by(|node| node.path().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Write the index file (§ format: magic 0x3ee3, version 1, one record
    /// per inode with an i64 nanosecond mtime).
    pub fn save(&self, index_file: &Path) -> Result<()> {
        let path = self.root_path.join(index_file);
        event("index::save", &path.display().to_string());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create index directory {}", parent.display()))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("failed to open index for writing: {}", path.display()))?;
        let mut out = BufWriter::new(file);

        out.write_all(&INDEX_MAGIC.to_le_bytes())?;
        out.write_all(&INDEX_VERSION.to_le_bytes())?;

        for node in &self.entries {
            write_string(&mut out, node.path())?;
            write_string(&mut out, &node.hash().to_string())?;
            out.write_all(&node.status().bits().to_le_bytes())?;
            out.write_all(&node.mtime().to_le_bytes())?;
            if node.is_symlink() {
                write_string(&mut out, node.target())?;
            }
        }

        out.flush()
            .with_context(|| format!("failed writing index: {}", path.display()))?;
        Ok(())
    }

    /// Load the index file, replacing the in-memory entries.
    pub fn load(&mut self, index_file: &Path) -> Result<()> {
        let path = self.root_path.join(index_file);
        event("index::load", &path.display().to_string());
        let context = format!("failed reading index: {}", path.display());

        let file = File::open(&path)
            .with_context(|| format!("failed to open index for reading: {}", path.display()))?;
        let mut input = BufReader::new(file);

        let magic = read_u16(&mut input, &context)?;
        if magic != INDEX_MAGIC {
            return Err(Error::Format(format!("{context}: invalid magic")).into());
        }
        let version = read_u16(&mut input, &context)?;
        if version != INDEX_VERSION {
            return Err(Error::Format(format!("{context}: invalid version {version}")).into());
        }

        self.entries.clear();
        while let Some(path) = try_read_string(&mut input, &context)? {
            let hash_str = read_string(&mut input, &context)?;
            let hash = Digest::parse(&hash_str)
                .map_err(|err| Error::Format(format!("{context}: {err}")))?;
            let status = FileStatus::from_bits(read_u32(&mut input, &context)?);
            let mtime = read_i64(&mut input, &context)?;
            let target = if status.is_symlink() {
                read_string(&mut input, &context)?
            } else {
                String::new()
            };
            self.entries
                .push(Inode::new(path, status, mtime, 0, target, hash));
        }

        Ok(())
    }

    /// Re-walk the root and merge against the current entries, keeping hashes
    /// whose metadata proves the content unchanged. Afterwards every entry
    /// either carries a valid hash or is dirty, and every ancestor of a dirty
    /// entry is dirty.
    pub fn refresh(&mut self) -> Result<()> {
        event("index::refresh", &self.root_path.display().to_string());
        debug!(root = %self.root_path.display(), "index refresh");

        let walked = walk::walk(&self.root_path, &self.ignores)?;
        let hash_len = Algorithm::active().hex_len();

        let mut merged: Vec<Inode> = Vec::with_capacity(walked.entries.len());
        let mut changed: Vec<usize> = Vec::new();
        let mut old = self.entries.iter().peekable();

        for mut node in walked.entries {
            // Drop old entries below the walked path: those files are gone.
            while let Some(prev) = old.peek() {
                if prev.path() < node.path() {
                    old.next();
                } else {
                    break;
                }
            }

            // An equivalent previous entry proves the content unchanged; its
            // hash is adopted when it matches the active algorithm. (After an
            // algorithm switch nothing adopts, and everything rehashes.)
            let mut unchanged = false;
            if let Some(prev) = old.peek() {
                if prev.path() == node.path() {
                    if prev.is_equivalent(&node) {
                        unchanged = true;
                        if prev.hash().hexdigest().len() == hash_len {
                            node.set_hash(prev.hash().clone());
                        }
                    }
                    old.next();
                }
            }
            if !unchanged {
                changed.push(merged.len());
            }
            merged.push(node);
        }

        propagate_dirty(&mut merged, &changed);

        self.entries = merged;
        self.root = walked.root;
        Ok(())
    }

    /// Adopt mtimes from `other` wherever path and digest agree. Running this
    /// before a checkout suppresses rewrites of files whose cached content
    /// already matches the working tree.
    pub fn copy_metadata(&mut self, other: &Index) {
        let mut oi = 0;
        for node in &mut self.entries {
            while oi < other.entries.len() && other.entries[oi].path() < node.path() {
                oi += 1;
            }
            if oi == other.entries.len() {
                break;
            }
            let theirs = &other.entries[oi];
            if theirs.path() == node.path() {
                // Symlinks carry empty hashes on both sides; the target check
                // during checkout still catches a changed link.
                if node.hash() == theirs.hash() {
                    node.set_mtime(theirs.mtime());
                }
                oi += 1;
            }
        }
    }

    /// If `ignore_path` names a regular file in this index, load ignore
    /// patterns from its cached object.
    pub fn load_ignore_from_index(&mut self, cache: &Cache, ignore_path: &Path) -> Result<()> {
        let Some(rel) = ignore_path.to_str() else {
            return Ok(());
        };
        let Some(node) = self.find_node_by_path(rel) else {
            return Ok(());
        };
        if !node.is_file() || node.hash().is_empty() {
            return Ok(());
        }
        self.ignores = GlobList::load(&cache.file_object_path(node.hash()))?;
        Ok(())
    }

    /// Reconcile `dest` with this index using minimal filesystem mutations.
    /// Extraneous entries are removed, missing ones materialized from the
    /// cache, and metadata-only differences patched in place.
    pub fn checkout(&mut self, cache: &Cache, dest: &Path) -> Result<()> {
        event("index::checkout", &dest.display().to_string());
        debug!(dest = %dest.display(), entries = self.entries.len(), "index checkout");

        fs::create_dir_all(dest)
            .with_context(|| format!("failed to create directory {}", dest.display()))?;
        let canonical_dest = fs::canonicalize(dest)
            .with_context(|| format!("failed to resolve {}", dest.display()))?;

        let walked = walk::walk(dest, &self.ignores)?;
        let tree = walked.entries;

        let mut ti = 0;
        let mut ii = 0;

        loop {
            let tree_node = tree.get(ti);
            let have_index = ii < self.entries.len();

            match (tree_node, have_index) {
                (None, false) => break,
                (None, true) => {
                    self.checkout_node(cache, ii, dest)?;
                    ii += 1;
                }
                (Some(node), false) => {
                    remove_tree_entry(dest, node)?;
                    ti += 1;
                }
                (Some(node), true) => {
                    if node.path() < self.entries[ii].path() {
                        // A parent that turned into a symlink makes this path
                        // point elsewhere; leave it alone.
                        if parent_is_canonical(&canonical_dest, node.path()) {
                            remove_tree_entry(dest, node)?;
                        }
                        ti += 1;
                        continue;
                    }
                    if node.path() > self.entries[ii].path() {
                        self.checkout_node(cache, ii, dest)?;
                        ii += 1;
                        continue;
                    }

                    let full = dest.join(node.path());
                    if node.status().file_type() != self.entries[ii].status().file_type() {
                        if node.is_directory() {
                            remove_dir_tolerant(&full)?;
                            // Everything below it is gone with it.
                            let prefix = format!("{}/", node.path());
                            ti += 1;
                            while ti < tree.len() && tree[ti].path().starts_with(&prefix) {
                                ti += 1;
                            }
                        } else {
                            remove_file_tolerant(&full)?;
                            ti += 1;
                        }
                        self.checkout_node(cache, ii, dest)?;
                        ii += 1;
                        continue;
                    }

                    if node.mtime() != self.entries[ii].mtime() && !self.entries[ii].is_directory()
                    {
                        self.checkout_node(cache, ii, dest)?;
                    }

                    if node.status().perms() != self.entries[ii].status().perms() {
                        set_perms(&full, self.entries[ii].status())?;
                    }

                    if self.entries[ii].target() != node.target() {
                        remove_file_tolerant(&full)?;
                        self.checkout_node(cache, ii, dest)?;
                    }

                    ti += 1;
                    ii += 1;
                }
            }
        }

        Ok(())
    }

    fn checkout_node(&mut self, cache: &Cache, ii: usize, dest: &Path) -> Result<()> {
        let node = &mut self.entries[ii];
        let full = dest.join(node.path());

        if node.is_symlink() {
            remove_file_tolerant(&full)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(node.target(), &full).with_context(|| {
                format!("failed to create symlink {} -> {}", full.display(), node.target())
            })?;
            #[cfg(not(unix))]
            anyhow::bail!("symlinks are not supported on this platform");
        } else if node.is_directory() {
            match fs::create_dir(&full) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create directory {}", full.display())
                    });
                }
            }
            set_perms(&full, node.status())?;
        } else {
            remove_file_tolerant(&full)?;
            cache.copy_file(node.hash(), &full)?;
            set_perms(&full, node.status())?;
        }

        let meta = fs::symlink_metadata(&full)
            .with_context(|| format!("failed to stat {}", full.display()))?;
        node.set_mtime(mtime_ns(&meta));
        node.set_status(FileStatus::from_metadata(&meta));
        Ok(())
    }
}

/// Mark every ancestor directory of a changed entry dirty, so its tree
/// object is reserialized with the child's new hash.
fn propagate_dirty(entries: &mut [Inode], changed: &[usize]) {
    let mut dirty_dirs: HashSet<String> = HashSet::new();
    for &i in changed {
        let mut parent = entries[i].parent_path();
        while !parent.is_empty() {
            if !dirty_dirs.insert(parent.to_string()) {
                break;
            }
            parent = match parent.rsplit_once('/') {
                Some((up, _)) => up,
                None => "",
            };
        }
    }
    if dirty_dirs.is_empty() {
        return;
    }
    for node in entries.iter_mut() {
        if node.is_directory() && dirty_dirs.contains(node.path()) {
            node.set_dirty();
        }
    }
}

fn parent_is_canonical(canonical_dest: &Path, rel: &str) -> bool {
    let full = canonical_dest.join(rel);
    let Some(parent) = full.parent() else {
        return true;
    };
    match fs::canonicalize(parent) {
        Ok(canonical) => canonical == parent,
        // Parent already removed: the pending removal below it is a no-op
        // either way.
        Err(_) => false,
    }
}

fn remove_tree_entry(dest: &Path, node: &Inode) -> Result<()> {
    let full = dest.join(node.path());
    if node.is_directory() {
        remove_dir_tolerant(&full)
    } else {
        remove_file_tolerant(&full)
    }
}

fn remove_dir_tolerant(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn remove_file_tolerant(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(unix)]
fn set_perms(path: &Path, status: FileStatus) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(status.perms()))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_perms(_path: &Path, _status: FileStatus) -> Result<()> {
    Ok(())
}

fn write_string<W: Write>(out: &mut W, s: &str) -> std::io::Result<()> {
    out.write_all(&(s.len() as u64).to_le_bytes())?;
    out.write_all(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FileType;

    fn entry(path: &str, ty: FileType, mtime: i64, hash: Digest) -> Inode {
        Inode::new(
            path.to_string(),
            FileStatus::new(ty, 0o644),
            mtime,
            0,
            String::new(),
            hash,
        )
    }

    #[test]
    fn find_node_by_path_is_exact() {
        let mut index = Index::new(Path::new("/tmp/x"));
        index.push(entry("a", FileType::Regular, 0, Digest::none()));
        index.push(entry("a/b", FileType::Regular, 0, Digest::none()));
        index.push(entry("ab", FileType::Regular, 0, Digest::none()));

        assert!(index.find_node_by_path("a/b").is_some());
        assert!(index.find_node_by_path("a/").is_none());
        assert!(index.find_node_by_path("b").is_none());
    }

    #[test]
    fn copy_metadata_requires_matching_digest() {
        let hash = crate::hashing::hash_bytes(b"same");
        let other_hash = crate::hashing::hash_bytes(b"other");

        let mut dst = Index::new(Path::new("/tmp/a"));
        dst.push(entry("differs", FileType::Regular, 1, hash.clone()));
        dst.push(entry("same", FileType::Regular, 1, hash.clone()));

        let mut src = Index::new(Path::new("/tmp/b"));
        src.push(entry("differs", FileType::Regular, 99, other_hash));
        src.push(entry("same", FileType::Regular, 99, hash));

        dst.copy_metadata(&src);
        assert_eq!(dst.find_node_by_path("same").unwrap().mtime(), 99);
        assert_eq!(dst.find_node_by_path("differs").unwrap().mtime(), 1);
    }

    #[test]
    fn propagate_dirty_clears_ancestor_hashes() {
        let tree_hash = crate::hashing::hash_bytes(b"t");
        let mut entries = vec![
            entry("a", FileType::Directory, 0, tree_hash.clone()),
            entry("a/b", FileType::Directory, 0, tree_hash.clone()),
            entry("a/b/f", FileType::Regular, 0, Digest::none()),
            entry("c", FileType::Directory, 0, tree_hash.clone()),
        ];
        propagate_dirty(&mut entries, &[2]);
        assert!(entries[0].is_dirty());
        assert!(entries[1].is_dirty());
        assert!(!entries[3].is_dirty());
    }
}
