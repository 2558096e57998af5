// On-disk image cache keyed by URL hash, evicted by last access down to a byte budget.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::CacheWriteError;

const ENTRY_EXT: &str = "img";
const PART_EXT: &str = "part";

/// BLAKE3 digest of a source URL. The lowercase hex form is the on-disk file stem.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn for_url(url: &str) -> Self {
        Self(*blake3::hash(url.as_bytes()).as_bytes())
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Self(*h.as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..16])
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    size: u64,
    last_access: SystemTime,
}

/// A cached image as seen by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub size: u64,
    pub last_access: SystemTime,
}

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: usize,
    pub freed_bytes: u64,
}

pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
    max_entry_bytes: u64,
    index: Mutex<HashMap<CacheKey, EntryMeta>>,
    total_bytes: AtomicU64,
    next_part: AtomicU64,
}

impl DiskCache {
    /// Open (or create) a cache rooted at `dir`.
    ///
    /// Leftover `.part` files from interrupted writes are deleted, existing entries are
    /// indexed by size and modification time, and the budget is enforced immediately.
    pub fn open(dir: &Path, max_bytes: u64, max_entry_bytes: u64) -> Result<Self> {
        if max_bytes == 0 {
            return Err(anyhow!("max_bytes must be > 0"));
        }
        if max_entry_bytes == 0 {
            return Err(anyhow!("max_entry_bytes must be > 0"));
        }

        fs::create_dir_all(dir)?;

        let mut index = HashMap::new();
        let mut total = 0u64;
        let mut stale_parts = 0usize;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

            if ext == PART_EXT {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("failed to remove stale part file {}: {}", path.display(), e);
                } else {
                    stale_parts += 1;
                }
                continue;
            }
            if ext != ENTRY_EXT {
                continue;
            }

            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let key = match CacheKey::from_hex(stem) {
                // Entries are only ever written under the lowercase stem.
                Some(key) if key.to_hex() == stem => key,
                _ => continue,
            };

            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let last_access = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += meta.len();
            index.insert(
                key,
                EntryMeta {
                    size: meta.len(),
                    last_access,
                },
            );
        }

        info!(
            "image cache opened dir={} entries={} bytes={} stale_parts={}",
            dir.display(),
            index.len(),
            total,
            stale_parts
        );

        let cache = Self {
            dir: dir.to_path_buf(),
            max_bytes,
            max_entry_bytes,
            index: Mutex::new(index),
            total_bytes: AtomicU64::new(total),
            next_part: AtomicU64::new(0),
        };
        cache.evict_to_budget()?;
        Ok(cache)
    }

    pub fn key_for(url: &str) -> CacheKey {
        CacheKey::for_url(url)
    }

    /// Final on-disk location of the entry for `url`, whether or not it exists.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.entry_path(&CacheKey::for_url(url))
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, ENTRY_EXT))
    }

    pub fn contains(&self, url: &str) -> bool {
        self.contains_key(&CacheKey::for_url(url))
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.index.lock().contains_key(key)
    }

    /// Read the cached bytes for `url`, refreshing its last-access time on a hit.
    pub fn get(&self, url: &str) -> Result<Option<Bytes>> {
        self.get_key(&CacheKey::for_url(url))
    }

    pub fn get_key(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        if !self.contains_key(key) {
            return Ok(None);
        }

        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(data) => {
                self.touch(key, &path);
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Deleted behind our back; drop the stale index entry.
                debug!("cache entry {} vanished from disk", key);
                self.forget(key);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn touch(&self, key: &CacheKey, path: &Path) {
        let now = SystemTime::now();
        {
            let mut index = self.index.lock();
            match index.get_mut(key) {
                Some(meta) => meta.last_access = now,
                None => return,
            }
        }
        // Persist the access time so it survives a restart.
        let result = OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.set_modified(now));
        if let Err(e) = result {
            debug!("failed to refresh mtime of {}: {}", path.display(), e);
        }
    }

    /// Store a complete image.
    pub fn put(self: &Arc<Self>, url: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.begin_write(url)?;
        writer.write(data)?;
        writer.commit()?;
        Ok(())
    }

    /// Start a streaming write for `url`. Nothing is visible to readers until `commit`.
    pub fn begin_write(self: &Arc<Self>, url: &str) -> Result<CacheWriter> {
        let key = CacheKey::for_url(url);
        let seq = self.next_part.fetch_add(1, Ordering::Relaxed);
        let part_path = self.dir.join(format!("{}.{}.{}", key, seq, PART_EXT));
        let file = File::create(&part_path)?;
        Ok(CacheWriter {
            cache: Arc::clone(self),
            key,
            part_path,
            file: Some(BufWriter::new(file)),
            written: 0,
            finished: false,
        })
    }

    fn insert_entry(&self, key: CacheKey, size: u64) {
        let mut index = self.index.lock();
        let previous = index.insert(
            key,
            EntryMeta {
                size,
                last_access: SystemTime::now(),
            },
        );
        if let Some(previous) = previous {
            self.total_bytes.fetch_sub(previous.size, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn forget(&self, key: &CacheKey) -> Option<u64> {
        let mut index = self.index.lock();
        let removed = index.remove(key)?;
        self.total_bytes.fetch_sub(removed.size, Ordering::Relaxed);
        Some(removed.size)
    }

    /// Remove the entry for `url`. Returns whether it was cached.
    pub fn remove(&self, url: &str) -> Result<bool> {
        let key = CacheKey::for_url(url);
        if self.forget(&key).is_none() {
            return Ok(false);
        }
        remove_if_exists(&self.entry_path(&key))?;
        Ok(true)
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        let keys: Vec<CacheKey> = {
            let mut index = self.index.lock();
            let keys = index.keys().copied().collect();
            index.clear();
            self.total_bytes.store(0, Ordering::Relaxed);
            keys
        };
        for key in &keys {
            remove_if_exists(&self.entry_path(key))?;
        }
        info!("image cache cleared entries={}", keys.len());
        Ok(())
    }

    /// Remove least-recently-accessed entries until the cache fits its budget.
    pub fn evict_to_budget(&self) -> Result<EvictionReport> {
        let victims: Vec<(CacheKey, u64)> = {
            let mut index = self.index.lock();
            let total = self.total_bytes.load(Ordering::Relaxed);
            if total <= self.max_bytes {
                return Ok(EvictionReport::default());
            }

            let mut candidates: Vec<(SystemTime, CacheKey, u64)> = index
                .iter()
                .map(|(k, m)| (m.last_access, *k, m.size))
                .collect();
            candidates.sort();

            let mut remaining = total;
            let mut victims = Vec::new();
            for (_, key, size) in candidates {
                if remaining <= self.max_bytes {
                    break;
                }
                index.remove(&key);
                remaining -= size;
                victims.push((key, size));
            }
            self.total_bytes.store(remaining, Ordering::Relaxed);
            victims
        };

        let mut report = EvictionReport::default();
        for (key, size) in victims {
            let path = self.entry_path(&key);
            if let Err(e) = remove_if_exists(&path) {
                warn!("failed to evict {}: {}", path.display(), e);
            }
            report.removed += 1;
            report.freed_bytes += size;
        }

        if report.removed > 0 {
            debug!(
                "evicted {} entries ({} bytes), cache now {} bytes",
                report.removed,
                report.freed_bytes,
                self.total_bytes()
            );
        }
        Ok(report)
    }

    /// Snapshot of the index, least recently accessed first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let index = self.index.lock();
        let mut entries: Vec<CacheEntry> = index
            .iter()
            .map(|(key, meta)| CacheEntry {
                key: *key,
                size: meta.size,
                last_access: meta.last_access,
            })
            .collect();
        entries.sort_by(|a, b| (a.last_access, a.key).cmp(&(b.last_access, b.key)));
        entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.index.lock().len()
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn max_entry_bytes(&self) -> u64 {
        self.max_entry_bytes
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Streaming write into the cache.
///
/// Bytes go to a private `.part` file and only become a cache entry on `commit`.
/// Dropping the writer without committing discards the partial file.
pub struct CacheWriter {
    cache: Arc<DiskCache>,
    key: CacheKey,
    part_path: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
    finished: bool,
}

impl CacheWriter {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `data`. Exceeding the per-entry limit discards the writer.
    pub fn write(&mut self, data: &[u8]) -> Result<(), CacheWriteError> {
        if self.finished {
            return Err(CacheWriteError::Finished);
        }
        let limit = self.cache.max_entry_bytes;
        if self.written + data.len() as u64 > limit {
            self.discard();
            return Err(CacheWriteError::EntryTooLarge { limit });
        }
        let file = self.file.as_mut().ok_or(CacheWriteError::Finished)?;
        if let Err(e) = file.write_all(data) {
            self.discard();
            return Err(e.into());
        }
        self.written += data.len() as u64;
        Ok(())
    }

    /// Publish the entry, replacing any previous version. Returns its size.
    pub fn commit(mut self) -> Result<u64, CacheWriteError> {
        if self.finished {
            return Err(CacheWriteError::Finished);
        }
        if self.written == 0 {
            self.discard();
            return Err(CacheWriteError::Empty);
        }

        let result = self.finish_file();
        if let Err(e) = result {
            self.discard();
            return Err(e.into());
        }

        let final_path = self.cache.entry_path(&self.key);
        if let Err(e) = fs::rename(&self.part_path, &final_path) {
            self.discard();
            return Err(e.into());
        }
        self.finished = true;
        self.cache.insert_entry(self.key, self.written);
        debug!("cache entry {} committed ({} bytes)", self.key, self.written);
        Ok(self.written)
    }

    fn finish_file(&mut self) -> io::Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already closed"))?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        drop(file);
        Ok(())
    }

    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.file = None;
        if let Err(e) = remove_if_exists(&self.part_path) {
            warn!("failed to remove {}: {}", self.part_path.display(), e);
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        // Best-effort deletion of an uncommitted part file.
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hex_roundtrip_and_stability() {
        let a = CacheKey::for_url("http://example.com/a.png");
        let b = CacheKey::for_url("http://example.com/a.png");
        let c = CacheKey::for_url("http://example.com/b.png");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 64);
        assert_eq!(CacheKey::from_hex(&a.to_hex()), Some(a));
        assert_eq!(CacheKey::from_hex("not-hex"), None);
    }

    #[test]
    fn test_writer_drop_removes_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 1024, 512).unwrap());
        {
            let mut writer = cache.begin_write("http://x/y.png").unwrap();
            writer.write(b"partial").unwrap();
        }
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
        assert!(!cache.contains("http://x/y.png"));
    }

    #[test]
    fn test_commit_replaces_and_adjusts_total() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 1024, 512).unwrap());
        cache.put("http://x/y.png", &[1u8; 100]).unwrap();
        assert_eq!(cache.total_bytes(), 100);
        cache.put("http://x/y.png", &[2u8; 40]).unwrap();
        assert_eq!(cache.total_bytes(), 40);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.get("http://x/y.png").unwrap().unwrap(), vec![2u8; 40]);
    }

    #[test]
    fn test_empty_commit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 1024, 512).unwrap());
        let writer = cache.begin_write("http://x/empty").unwrap();
        assert!(matches!(writer.commit(), Err(CacheWriteError::Empty)));
        assert_eq!(cache.entry_count(), 0);
    }
}
