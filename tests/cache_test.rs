use std::fs::{self, OpenOptions};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bb_image_engine::engine::cache::DiskCache;
use bb_image_engine::error::CacheWriteError;

const A: &str = "http://example.com/a.png";
const B: &str = "http://example.com/b.png";
const C: &str = "http://example.com/c.png";
const D: &str = "http://example.com/d.png";

fn open(dir: &std::path::Path, max_bytes: u64) -> Arc<DiskCache> {
    Arc::new(DiskCache::open(dir, max_bytes, 1024).unwrap())
}

fn set_mtime(path: &std::path::Path, secs: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[test]
fn test_put_get_remove() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 4096);

    assert!(!cache.contains(A));
    assert!(cache.get(A).unwrap().is_none());

    cache.put(A, &[0xABu8; 100]).unwrap();
    assert!(cache.contains(A));
    assert!(cache.path_for(A).exists());
    assert_eq!(cache.get(A).unwrap().unwrap(), vec![0xABu8; 100]);
    assert_eq!(cache.total_bytes(), 100);
    assert_eq!(cache.entry_count(), 1);

    assert!(cache.remove(A).unwrap());
    assert!(!cache.remove(A).unwrap());
    assert!(!cache.path_for(A).exists());
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn test_evicts_least_recently_accessed() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 300);

    for url in [A, B, C] {
        cache.put(url, &[1u8; 100]).unwrap();
        sleep(Duration::from_millis(20));
    }

    // Reading A makes B the oldest entry.
    cache.get(A).unwrap().unwrap();
    sleep(Duration::from_millis(20));
    cache.put(D, &[2u8; 100]).unwrap();
    assert_eq!(cache.total_bytes(), 400);

    let report = cache.evict_to_budget().unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.freed_bytes, 100);
    assert!(!cache.contains(B));
    assert!(!cache.path_for(B).exists());
    for url in [A, C, D] {
        assert!(cache.contains(url), "{} should survive", url);
    }
    assert_eq!(cache.total_bytes(), 300);
}

#[test]
fn test_within_budget_evicts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 300);
    cache.put(A, &[1u8; 100]).unwrap();
    let report = cache.evict_to_budget().unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(cache.entry_count(), 1);
}

#[test]
fn test_reopen_indexes_entries_and_removes_parts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = open(dir.path(), 4096);
        cache.put(A, &[1u8; 10]).unwrap();
        cache.put(B, &[2u8; 20]).unwrap();
    }
    fs::write(dir.path().join("deadbeef.0.part"), b"half written").unwrap();
    fs::write(dir.path().join("notes.txt"), b"not ours").unwrap();

    let cache = open(dir.path(), 4096);
    assert_eq!(cache.entry_count(), 2);
    assert_eq!(cache.total_bytes(), 30);
    assert_eq!(cache.get(B).unwrap().unwrap(), vec![2u8; 20]);
    assert!(!dir.path().join("deadbeef.0.part").exists());
    assert!(dir.path().join("notes.txt").exists());
}

#[test]
fn test_reopen_ignores_uppercase_stems() {
    let dir = tempfile::tempdir().unwrap();
    let upper = DiskCache::key_for(A).to_hex().to_uppercase();
    fs::write(dir.path().join(format!("{}.img", upper)), [1u8; 50]).unwrap();

    let cache = open(dir.path(), 4096);
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.total_bytes(), 0);
    assert!(!cache.contains(A));
}

#[test]
fn test_reopen_with_smaller_budget_uses_file_mtime() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = open(dir.path(), 4096);
        cache.put(A, &[1u8; 100]).unwrap();
        cache.put(B, &[2u8; 100]).unwrap();
        cache.put(C, &[3u8; 100]).unwrap();
        set_mtime(&cache.path_for(A), 3_000);
        set_mtime(&cache.path_for(B), 1_000);
        set_mtime(&cache.path_for(C), 2_000);
    }

    let cache = open(dir.path(), 150);
    assert_eq!(cache.entry_count(), 1);
    assert!(cache.contains(A));
    assert!(!cache.contains(B));
    assert!(!cache.contains(C));
}

#[test]
fn test_get_refreshes_mtime_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 4096);
    cache.put(A, &[1u8; 10]).unwrap();
    set_mtime(&cache.path_for(A), 1_000);

    let before = SystemTime::now() - Duration::from_secs(5);
    cache.get(A).unwrap().unwrap();
    let mtime = fs::metadata(cache.path_for(A)).unwrap().modified().unwrap();
    assert!(mtime > before);
}

#[test]
fn test_entries_sorted_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 4096);
    cache.put(A, &[1u8; 10]).unwrap();
    sleep(Duration::from_millis(20));
    cache.put(B, &[1u8; 20]).unwrap();

    let entries = cache.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].key, DiskCache::key_for(A));
    assert_eq!(entries[1].size, 20);
}

#[test]
fn test_vanished_file_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 4096);
    cache.put(A, &[1u8; 10]).unwrap();
    fs::remove_file(cache.path_for(A)).unwrap();

    assert!(cache.get(A).unwrap().is_none());
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn test_oversized_entry_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(DiskCache::open(dir.path(), 4096, 64).unwrap());

    let mut writer = cache.begin_write(A).unwrap();
    writer.write(&[0u8; 60]).unwrap();
    let err = writer.write(&[0u8; 10]).unwrap_err();
    assert!(matches!(err, CacheWriteError::EntryTooLarge { limit: 64 }));
    assert!(matches!(writer.commit(), Err(CacheWriteError::Finished)));

    assert!(!cache.contains(A));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_streaming_write_invisible_until_commit() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 4096);

    let mut writer = cache.begin_write(A).unwrap();
    writer.write(b"first ").unwrap();
    writer.write(b"second").unwrap();
    assert!(!cache.contains(A));

    assert_eq!(writer.commit().unwrap(), 12);
    assert_eq!(&cache.get(A).unwrap().unwrap()[..], b"first second");
}

#[test]
fn test_clear() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path(), 4096);
    cache.put(A, &[1u8; 10]).unwrap();
    cache.put(B, &[1u8; 10]).unwrap();
    cache.clear().unwrap();
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.total_bytes(), 0);
    assert!(!cache.path_for(A).exists());
}
