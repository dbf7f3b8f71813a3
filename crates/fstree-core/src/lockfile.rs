use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use parking_lot::{Mutex, MutexGuard};

use crate::errors::Error;

/// Cross-process lock backed by an exclusive OS file lock.
///
/// The file lock serializes object-store mutations across processes sharing
/// one cache directory. OS file locks do not exclude threads within the same
/// process (they act on the shared descriptor), so every acquisition also
/// holds an in-process mutex.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
    mutex: Mutex<()>,
}

/// Scoped lock; released on drop.
pub struct LockGuard<'a> {
    file: &'a File,
    _thread: MutexGuard<'a, ()>,
}

impl LockFile {
    pub fn new(path: &Path) -> Result<LockFile> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to create lock file {}", path.display()))?;
        Ok(LockFile {
            path: path.to_path_buf(),
            file,
            mutex: Mutex::new(()),
        })
    }

    /// Block until the lock is held, both in-process and across processes.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        let thread = self.mutex.lock();
        self.file.lock_exclusive().map_err(|err| {
            Error::Lock(format!("failed to lock {}: {err}", self.path.display()))
        })?;
        Ok(LockGuard {
            file: &self.file,
            _thread: thread,
        })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
