use std::fs;
use std::path::Path;

use fstree_core::{remote, Cache, Index, DEFAULT_MAX_SIZE, DEFAULT_RETENTION};

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn cache_at(root: &Path, name: &str) -> Cache {
    Cache::new(&root.join(name), DEFAULT_MAX_SIZE, DEFAULT_RETENTION).unwrap()
}

#[test]
fn push_then_pull_reconstructs_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let ws = dir.path().join("ws");
    write(&ws, "a.txt", "alpha");
    write(&ws, "sub/b.txt", "beta");
    write(&ws, "sub/deep/c.bin", "gamma");
    #[cfg(unix)]
    std::os::unix::fs::symlink("a.txt", ws.join("link")).unwrap();

    let remote_dir = dir.path().join("remote");
    fs::create_dir_all(&remote_dir).unwrap();
    let remote = remote::from_url(&format!("file://{}", remote_dir.display())).unwrap();

    // Cache A writes and pushes the snapshot.
    let cache_a = cache_at(dir.path(), "cache-a");
    let mut index_a = Index::new(&ws);
    index_a.refresh().unwrap();
    cache_a.add(&mut index_a).unwrap();
    let root = index_a.root().hash().clone();
    cache_a.push(&index_a, &remote).unwrap();

    // Cache B pulls into an empty cache and checks out.
    let cache_b = cache_at(dir.path(), "cache-b");
    let dest = dir.path().join("dest");
    let mut index_b = Index::new(&dest);
    cache_b.pull(&mut index_b, &remote, &root).unwrap();
    index_b.sort();

    assert_eq!(index_b.len(), index_a.len());
    for (a, b) in index_a.iter().zip(index_b.iter()) {
        assert_eq!(a.path(), b.path());
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.status().file_type(), b.status().file_type());
        assert_eq!(a.target(), b.target());
    }

    index_b.checkout(&cache_b, &dest).unwrap();
    assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(fs::read(dest.join("sub/b.txt")).unwrap(), b"beta");
    assert_eq!(fs::read(dest.join("sub/deep/c.bin")).unwrap(), b"gamma");
    #[cfg(unix)]
    assert_eq!(
        fs::read_link(dest.join("link")).unwrap(),
        Path::new("a.txt")
    );

    // The pulled tree re-hashes to the pushed root.
    let mut reindex = Index::new(&dest);
    reindex.refresh().unwrap();
    cache_b.add(&mut reindex).unwrap();
    assert_eq!(reindex.root().hash(), &root);
}

#[test]
fn push_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ws = dir.path().join("ws");
    write(&ws, "only.txt", "o");

    let remote_dir = dir.path().join("remote");
    fs::create_dir_all(&remote_dir).unwrap();
    let remote = remote::from_url(&format!("file://{}", remote_dir.display())).unwrap();

    let cache = cache_at(dir.path(), "cache");
    let mut index = Index::new(&ws);
    index.refresh().unwrap();
    cache.add(&mut index).unwrap();

    cache.push(&index, &remote).unwrap();
    let count = walk_count(&remote_dir);
    cache.push(&index, &remote).unwrap();
    assert_eq!(walk_count(&remote_dir), count);
}

#[test]
fn pull_skips_objects_already_present() {
    let dir = tempfile::tempdir().unwrap();
    let ws = dir.path().join("ws");
    write(&ws, "one.txt", "1");

    let remote_dir = dir.path().join("remote");
    fs::create_dir_all(&remote_dir).unwrap();
    let remote = remote::from_url(&format!("file://{}", remote_dir.display())).unwrap();

    let cache = cache_at(dir.path(), "cache");
    let mut index = Index::new(&ws);
    index.refresh().unwrap();
    cache.add(&mut index).unwrap();
    let root = index.root().hash().clone();
    cache.push(&index, &remote).unwrap();

    // Pulling into the same cache finds everything locally; the remote
    // could even disappear mid-way for the object fetches.
    let mut pulled = Index::new(&ws);
    cache.pull(&mut pulled, &remote, &root).unwrap();
    pulled.sort();
    assert_eq!(pulled.len(), index.len());
}

#[test]
fn pull_of_unknown_tree_fails() {
    let dir = tempfile::tempdir().unwrap();
    let remote_dir = dir.path().join("remote");
    fs::create_dir_all(&remote_dir).unwrap();
    let remote = remote::from_url(&format!("file://{}", remote_dir.display())).unwrap();

    let cache = cache_at(dir.path(), "cache");
    let mut index = Index::new(&dir.path().join("ws"));
    let missing = fstree_core::hash_bytes(b"never pushed");
    assert!(cache.pull(&mut index, &remote, &missing).is_err());
}

fn walk_count(dir: &Path) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    count
}
