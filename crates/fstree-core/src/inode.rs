use std::path::Path;

use anyhow::Result;

use crate::digest::Digest;
use crate::hashing;
use crate::status::{FileStatus, FileType};

/// One entry of a snapshot: a file, directory, or symlink, identified by its
/// slash-separated path relative to the index root.
///
/// An inode with an empty digest is *dirty*: its content hash (for files) or
/// tree object (for directories) has not been computed yet. Symlinks never
/// carry a hash; their identity is the target string recorded in the parent
/// tree object.
#[derive(Debug, Clone, Default)]
pub struct Inode {
    path: String,
    hash: Digest,
    status: FileStatus,
    mtime: i64,
    size: u64,
    target: String,
    ignored: bool,
    unignored: bool,
}

impl Inode {
    pub fn new(
        path: String,
        status: FileStatus,
        mtime: i64,
        size: u64,
        target: String,
        hash: Digest,
    ) -> Inode {
        Inode {
            path,
            hash,
            status,
            mtime,
            size,
            target,
            ignored: false,
            unignored: false,
        }
    }

    /// The root sentinel: an empty-path directory with no hash.
    pub fn root() -> Inode {
        Inode {
            status: FileStatus::new(FileType::Directory, 0),
            ..Inode::default()
        }
    }

    /// Path relative to the index root, forward slashes, no leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Path of the containing directory; empty for top-level entries.
    pub fn parent_path(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => "",
        }
    }

    pub fn hash(&self) -> &Digest {
        &self.hash
    }

    pub fn set_hash(&mut self, hash: Digest) {
        self.hash = hash;
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn set_mtime(&mut self, mtime: i64) {
        self.mtime = mtime;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_file(&self) -> bool {
        self.status.is_regular()
    }

    pub fn is_directory(&self) -> bool {
        self.status.is_directory()
    }

    pub fn is_symlink(&self) -> bool {
        self.status.is_symlink()
    }

    /// Dirty means no valid digest: the inode must be rehashed (files) or
    /// reserialized (directories) before it can enter the object store.
    pub fn is_dirty(&self) -> bool {
        self.hash.is_empty()
    }

    pub fn set_dirty(&mut self) {
        self.hash = Digest::none();
    }

    pub(crate) fn ignore(&mut self) {
        self.ignored = true;
    }

    pub(crate) fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub(crate) fn unignore(&mut self) {
        self.unignored = true;
    }

    pub(crate) fn is_unignored(&self) -> bool {
        self.unignored
    }

    /// Metadata equivalence: same path, type, permissions, mtime, and symlink
    /// target. Size and digest are deliberately ignored; equivalence is what
    /// lets a refresh adopt a previously computed hash.
    pub fn is_equivalent(&self, other: &Inode) -> bool {
        self.path == other.path
            && self.status.file_type() == other.status.file_type()
            && self.status.perms() == other.status.perms()
            && self.mtime == other.mtime
            && self.target == other.target
    }

    /// Recompute the content digest by streaming `root/path`. Symlinks are
    /// never hashed.
    pub fn rehash(&mut self, root: &Path) -> Result<()> {
        debug_assert!(!self.is_symlink());
        self.hash = hashing::hash_file(&root.join(&self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, mtime: i64) -> Inode {
        Inode::new(
            path.to_string(),
            FileStatus::new(FileType::Regular, 0o644),
            mtime,
            0,
            String::new(),
            Digest::none(),
        )
    }

    #[test]
    fn name_and_parent() {
        let node = file("src/lib.rs", 0);
        assert_eq!(node.name(), "lib.rs");
        assert_eq!(node.parent_path(), "src");

        let top = file("README", 0);
        assert_eq!(top.name(), "README");
        assert_eq!(top.parent_path(), "");
    }

    #[test]
    fn dirty_tracks_empty_hash() {
        let mut node = file("a", 0);
        assert!(node.is_dirty());
        node.set_hash(crate::hashing::hash_bytes(b"x"));
        assert!(!node.is_dirty());
        node.set_dirty();
        assert!(node.is_dirty());
    }

    #[test]
    fn equivalence_ignores_size_and_hash() {
        let mut a = file("a", 42);
        let mut b = file("a", 42);
        a.set_hash(crate::hashing::hash_bytes(b"one"));
        b.size = 999;
        assert!(a.is_equivalent(&b));

        b.set_mtime(43);
        assert!(!a.is_equivalent(&b));
    }
}
