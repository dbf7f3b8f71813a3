use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::digest::Digest;
use crate::errors::Error;
use crate::remote::Remote;

/// Directory-backed remote for `file://` URLs: a blob store on a local or
/// mounted path, sharded like the cache. Useful for air-gapped transfer and
/// as the hermetic transport in tests. `has_tree` is unsupported, so pushes
/// take the probe fallback.
pub struct FsRemote {
    root: PathBuf,
}

impl FsRemote {
    pub fn new(root: &Path) -> FsRemote {
        FsRemote {
            root: root.to_path_buf(),
        }
    }

    fn object_path(&self, hash: &Digest) -> PathBuf {
        let hex = hash.hexdigest();
        if hex.len() <= 2 {
            return self.root.join(hex);
        }
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl Remote for FsRemote {
    fn has_object(&self, hash: &Digest) -> Result<bool> {
        Ok(self.object_path(hash).is_file())
    }

    fn has_objects(&self, hashes: &[Digest]) -> Result<Vec<bool>> {
        hashes.iter().map(|hash| self.has_object(hash)).collect()
    }

    fn has_tree(&self, _hash: &Digest) -> Result<(Vec<Digest>, Vec<Digest>)> {
        Err(Error::Unsupported("has_tree on file remote".to_string()).into())
    }

    fn write_object(&self, hash: &Digest, path: &Path) -> Result<()> {
        let object = self.object_path(hash);
        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        fs::copy(path, &object)
            .with_context(|| format!("failed to upload object {hash} to {}", object.display()))?;
        Ok(())
    }

    fn read_object(&self, hash: &Digest, path: &Path, tmp_dir: &Path) -> Result<()> {
        let object = self.object_path(hash);
        if !object.is_file() {
            return Err(Error::NotFound(format!("object {hash} on remote")).into());
        }

        let tmp = tempfile::NamedTempFile::new_in(tmp_dir)
            .context("failed to create temporary file")?;
        fs::copy(&object, tmp.path())
            .with_context(|| format!("failed to download object {hash}"))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        tmp.persist(path)
            .with_context(|| format!("failed to rename temporary file to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_bytes;

    #[test]
    fn write_then_read_roundtrip() {
        let remote_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let remote = FsRemote::new(remote_dir.path());

        let source = work.path().join("payload");
        fs::write(&source, b"object bytes").unwrap();
        let digest = hash_bytes(b"object bytes");

        assert!(!remote.has_object(&digest).unwrap());
        remote.write_object(&digest, &source).unwrap();
        assert!(remote.has_object(&digest).unwrap());

        let dest = work.path().join("fetched/object");
        let tmp = work.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        remote.read_object(&digest, &dest, &tmp).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"object bytes");
    }

    #[test]
    fn missing_object_is_not_found() {
        let remote_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let remote = FsRemote::new(remote_dir.path());
        let digest = hash_bytes(b"never uploaded");

        let err = remote
            .read_object(&digest, &work.path().join("out"), work.path())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NotFound(_))
        ));
    }

    #[test]
    fn has_tree_reports_unsupported() {
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = FsRemote::new(remote_dir.path());
        let err = remote.has_tree(&hash_bytes(b"t")).unwrap_err();
        assert!(Error::is_unsupported(&err));
    }
}
