use std::fs;
use std::path::Path;
use std::time::Duration;

use fstree_core::{Cache, Index};

fn shard_file(cache_root: &Path, shard: &str, name: &str, size: usize, age_secs: i64) {
    let dir = cache_root.join("objects").join(shard);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, vec![b'x'; size]).unwrap();
    let now = filetime::FileTime::now().unix_seconds();
    let stamp = filetime::FileTime::from_unix_time(now - age_secs, 0);
    filetime::set_file_times(&path, stamp, stamp).unwrap();
}

fn shard_entries(cache_root: &Path, shard: &str) -> Vec<String> {
    let dir = cache_root.join("objects").join(shard);
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn evicts_oldest_objects_down_to_the_shard_slice() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    // slice = max_size >> 8 = 100 bytes per shard
    let cache = Cache::new(&root, 100 << 8, Duration::ZERO).unwrap();

    shard_file(&root, "ab", "oldest.file", 60, 3000);
    shard_file(&root, "ab", "older.file", 60, 2000);
    shard_file(&root, "ab", "newest.file", 60, 1000);

    cache.evict().unwrap();

    // 180 -> 120 -> 60 (< 100, stop): exactly the newest object survives.
    assert_eq!(shard_entries(&root, "ab"), vec!["newest.file"]);
}

#[test]
fn retention_protects_recent_objects() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache = Cache::new(&root, 100 << 8, Duration::from_secs(3600)).unwrap();

    shard_file(&root, "cd", "a.file", 60, 10);
    shard_file(&root, "cd", "b.file", 60, 10);
    shard_file(&root, "cd", "c.file", 60, 10);

    cache.evict().unwrap();

    // Oversized, but everything is younger than the retention period.
    assert_eq!(shard_entries(&root, "cd").len(), 3);
}

#[test]
fn shards_are_evicted_independently() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache = Cache::new(&root, 100 << 8, Duration::ZERO).unwrap();

    shard_file(&root, "aa", "big.file", 90, 2000);
    shard_file(&root, "bb", "one.file", 150, 3000);
    shard_file(&root, "bb", "two.file", 30, 1000);

    cache.evict().unwrap();

    // aa is already under its slice; bb drops its oldest entry.
    assert_eq!(shard_entries(&root, "aa"), vec!["big.file"]);
    assert_eq!(shard_entries(&root, "bb"), vec!["two.file"]);
}

#[test]
fn under_budget_shards_are_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache = Cache::new(&root, 1 << 30, Duration::ZERO).unwrap();

    shard_file(&root, "ef", "keep.file", 1000, 5000);
    cache.evict().unwrap();
    assert_eq!(shard_entries(&root, "ef"), vec!["keep.file"]);
}

#[test]
fn touch_on_probe_shields_an_object_from_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let ws = dir.path().join("ws");
    fs::create_dir_all(&ws).unwrap();
    fs::write(ws.join("hot.txt"), "hot").unwrap();

    let root = dir.path().join("cache");
    // Tiny budget, generous retention: only the retention floor protects.
    let cache = Cache::new(&root, 0, Duration::from_secs(3600)).unwrap();

    let mut index = Index::new(&ws);
    index.refresh().unwrap();
    cache.add(&mut index).unwrap();
    let hash = index.find_node_by_path("hot.txt").unwrap().hash().clone();

    // The probe refreshed its mtime just now, so eviction must keep it.
    assert!(cache.has_object(&hash));
    cache.evict().unwrap();
    assert!(cache.has_object(&hash));
}
