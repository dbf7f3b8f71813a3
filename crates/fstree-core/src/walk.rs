use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::digest::Digest;
use crate::glob::GlobList;
use crate::inode::Inode;
use crate::pool::{pool, WaitGroup};
use crate::status::FileStatus;

/// Name of the workspace metadata directory. Never walked, never indexed.
pub(crate) const INDEX_DIR_NAME: &str = ".fstree";

/// A completed walk: the flat entry list (sorted by the requested order) and
/// the root sentinel.
pub struct WalkedTree {
    pub entries: Vec<Inode>,
    pub root: Inode,
}

/// Walk `root` recursively, sorted by path, applying `ignores`.
pub fn walk(root: &Path, ignores: &GlobList) -> Result<WalkedTree> {
    walk_with(root, ignores, true, |a, b| a.path().cmp(b.path()))
}

/// Walk `root` with explicit recursion and ordering. Subdirectories are
/// descended in parallel through `enqueue_or_run`; entries land in a shared
/// list under a mutex and are sorted afterwards on the calling thread.
pub fn walk_with<F>(
    root: &Path,
    ignores: &GlobList,
    recursive: bool,
    compare: F,
) -> Result<WalkedTree>
where
    F: Fn(&Inode, &Inode) -> Ordering,
{
    let ctx = Arc::new(WalkContext {
        root: root.to_path_buf(),
        ignores: ignores.clone(),
        recursive,
        entries: Mutex::new(Vec::new()),
    });

    read_directory(&ctx, String::new())?;

    let mut entries = std::mem::take(&mut *ctx.entries.lock());
    entries.sort_by(|a, b| compare(a, b));

    // Directories were filtered during descent; files get a final pass, in
    // reverse order so children are decided before their ancestors.
    for node in entries.iter_mut().rev() {
        if node.is_directory() {
            continue;
        }
        if !node.is_unignored() && ctx.ignores.matches(node.path()) {
            node.ignore();
        } else {
            node.unignore();
        }
    }
    entries.retain(|node| !node.is_ignored());

    Ok(WalkedTree {
        entries,
        root: Inode::root(),
    })
}

struct WalkContext {
    root: PathBuf,
    ignores: GlobList,
    recursive: bool,
    entries: Mutex<Vec<Inode>>,
}

fn read_directory(ctx: &Arc<WalkContext>, rel: String) -> Result<()> {
    let abs = if rel.is_empty() {
        ctx.root.clone()
    } else {
        ctx.root.join(&rel)
    };
    let dir = fs::read_dir(&abs)
        .with_context(|| format!("failed to open directory {}", abs.display()))?;

    let wg = WaitGroup::new();

    for entry in dir {
        let entry =
            entry.with_context(|| format!("failed to read directory {}", abs.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            anyhow::bail!("non-utf8 file name in {}", abs.display());
        };
        if name == INDEX_DIR_NAME {
            continue;
        }

        let rel_path = if rel.is_empty() {
            name.to_string()
        } else {
            format!("{rel}/{name}")
        };

        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;

        // Ignored directories prune the whole subtree here; ignored files are
        // filtered after the walk.
        if file_type.is_dir() && ctx.ignores.matches(&rel_path) {
            continue;
        }
        if !file_type.is_dir() && !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }

        // The entry may vanish between readdir and lstat; skip it like any
        // other unstattable entry.
        let meta = match fs::symlink_metadata(entry.path()) {
            Ok(meta) => meta,
            Err(_) => continue,
        };

        let target = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("failed to read symlink {}", entry.path().display()))?;
            match target.to_str() {
                Some(target) => target.to_string(),
                None => anyhow::bail!("non-utf8 symlink target at {}", entry.path().display()),
            }
        } else {
            String::new()
        };

        let node = Inode::new(
            rel_path.clone(),
            FileStatus::from_metadata(&meta),
            mtime_ns(&meta),
            meta.len(),
            target,
            Digest::none(),
        );
        ctx.entries.lock().push(node);

        if ctx.recursive && file_type.is_dir() {
            let ctx = Arc::clone(ctx);
            let wg_task = wg.clone();
            wg.add(1);
            pool().enqueue_or_run(move || {
                let result = read_directory(&ctx, rel_path);
                wg_task.finish(result);
            });
        }
    }

    wg.wait_result()
}

#[cfg(unix)]
pub(crate) fn mtime_ns(meta: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
}

#[cfg(not(unix))]
pub(crate) fn mtime_ns(meta: &fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => match time.duration_since(std::time::UNIX_EPOCH) {
            Ok(since) => since.as_nanos() as i64,
            Err(before) => -(before.duration().as_nanos() as i64),
        },
        Err(_) => 0,
    }
}
