// Read-through cache around any backend. Successful reads are remembered,
// writes and removals only invalidate. The cache is never asked whether
// something exists, `exists` always goes to the backend.
//
// Entries live in an lru-disk-cache directory owned by this process.
// Invalidation moves a key to a fresh generation instead of deleting files, a
// stale generation is simply never read again and ages out of the lru.
// Untracked keys sit at a shared floor generation. When too many keys are
// tracked the map is dropped and the floor moves past every generation
// handed out so far, which orphans all current entries at once.
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use lru_disk_cache::LruDiskCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use super::paths::{self, MARK};
use super::{ByteChunks, Keys, Storage};
use crate::error::{Error, Result};

/// Decides which keys may be cached.
pub trait CachePolicy: Send + Sync {
    fn cacheable(&self, key: &str) -> bool;
}

/// Caches small metadata objects. Layers are large and not yet verified while
/// being pushed, marks must always be read from the backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataOnly;

impl CachePolicy for MetadataOnly {
    fn cacheable(&self, key: &str) -> bool {
        let role = paths::role(key);
        role != "layer" && role != MARK
    }
}

/// Keys tracked with their own generation before the map is reset.
pub const TRACKING_LIMIT: usize = 64 * 1024;

struct Inner {
    lru: LruDiskCache,
    generations: HashMap<String, u64>,
    floor: u64,
    last: u64,
    tracking_limit: usize,
}

impl Inner {
    fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).copied().unwrap_or(self.floor)
    }
}

/// Process-wide content cache, cheap to clone and share between backends.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<Mutex<Inner>>,
    // removed when the last clone goes away
    _dir: Arc<TempDir>,
}

impl ContentCache {
    /// Opens a fresh cache in a new directory below `parent`.
    pub fn open(parent: &Path, capacity: u64) -> Result<ContentCache> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix("layerstore-cache-")
            .tempdir_in(parent)?;
        let lru = LruDiskCache::new(PathBuf::from(dir.path()), capacity)
            .map_err(|e| Error::Config(format!("cache in {}: {}", dir.path().display(), e)))?;
        debug!("content cache in {} ({} bytes)", dir.path().display(), capacity);
        Ok(ContentCache {
            inner: Arc::new(Mutex::new(Inner {
                lru,
                generations: HashMap::new(),
                floor: 0,
                last: 0,
                tracking_limit: TRACKING_LIMIT,
            })),
            _dir: Arc::new(dir),
        })
    }

    pub fn with_tracking_limit(self, limit: usize) -> ContentCache {
        self.inner.lock().tracking_limit = limit.max(1);
        self
    }

    fn generation(&self, key: &str) -> u64 {
        self.inner.lock().generation(key)
    }

    /// Number of keys carrying their own generation.
    pub fn tracked(&self) -> usize {
        self.inner.lock().generations.len()
    }

    fn entry_name(key: &str, generation: u64) -> String {
        hex::encode(Sha256::digest(format!("{}\n{}", key, generation).as_bytes()))
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let generation = inner.generation(key);
        let mut reader = inner.lru.get(Self::entry_name(key, generation)).ok()?;
        let mut content = Vec::new();
        match reader.read_to_end(&mut content) {
            Ok(_) => Some(content),
            Err(e) => {
                warn!("unreadable cache entry for {}: {}", key, e);
                None
            }
        }
    }

    // Stores content read at `generation`; a write since then makes it dead on arrival.
    fn insert(&self, key: &str, generation: u64, content: &[u8]) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.lru.insert_bytes(Self::entry_name(key, generation), content) {
            warn!("could not cache {}: {}", key, e);
        }
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.last += 1;
        if inner.generations.len() >= inner.tracking_limit && !inner.generations.contains_key(key) {
            debug!("dropping {} cache generations", inner.generations.len());
            inner.generations.clear();
            inner.floor = inner.last;
            return;
        }
        let generation = inner.last;
        inner.generations.insert(key.to_string(), generation);
    }
}

/// Wraps `inner` with a shared `ContentCache`.
pub struct CachedStorage<S, P = MetadataOnly> {
    inner: S,
    cache: ContentCache,
    policy: P,
}

impl<S: Storage> CachedStorage<S> {
    pub fn new(inner: S, cache: ContentCache) -> CachedStorage<S> {
        CachedStorage::with_policy(inner, cache, MetadataOnly)
    }
}

impl<S: Storage, P: CachePolicy> CachedStorage<S, P> {
    fn invalidate(&self, key: &str) {
        if self.policy.cacheable(key) {
            self.cache.invalidate(key);
        }
    }

    pub fn with_policy(inner: S, cache: ContentCache, policy: P) -> CachedStorage<S, P> {
        CachedStorage {
            inner,
            cache,
            policy,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Storage, P: CachePolicy> Storage for CachedStorage<S, P> {
    fn get_content(&self, key: &str) -> Result<Vec<u8>> {
        if !self.policy.cacheable(key) {
            return self.inner.get_content(key);
        }
        if let Some(content) = self.cache.get(key) {
            debug!("cache hit {}", key);
            return Ok(content);
        }
        debug!("cache miss {}", key);
        let generation = self.cache.generation(key);
        let content = self.inner.get_content(key)?;
        self.cache.insert(key, generation, &content);
        Ok(content)
    }

    fn put_content(&self, key: &str, content: &[u8]) -> Result<()> {
        self.invalidate(key);
        let written = self.inner.put_content(key, content);
        self.invalidate(key);
        written
    }

    fn stream_read(&self, key: &str) -> Result<ByteChunks> {
        self.inner.stream_read(key)
    }

    fn stream_write(&self, key: &str, source: &mut dyn Read) -> Result<()> {
        self.invalidate(key);
        let written = self.inner.stream_write(key, source);
        self.invalidate(key);
        written
    }

    fn list_directory(&self, prefix: &str) -> Result<Keys> {
        self.inner.list_directory(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.invalidate(key);
        let removed = self.inner.remove(key);
        self.invalidate(key);
        removed
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        self.inner.get_size(key)
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.inner.local_path(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inner: LocalStorage,
        reads: AtomicUsize,
    }

    impl Storage for Counting {
        fn get_content(&self, key: &str) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_content(key)
        }
        fn put_content(&self, key: &str, content: &[u8]) -> Result<()> {
            self.inner.put_content(key, content)
        }
        fn stream_read(&self, key: &str) -> Result<ByteChunks> {
            self.inner.stream_read(key)
        }
        fn stream_write(&self, key: &str, source: &mut dyn Read) -> Result<()> {
            self.inner.stream_write(key, source)
        }
        fn list_directory(&self, prefix: &str) -> Result<Keys> {
            self.inner.list_directory(prefix)
        }
        fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key)
        }
        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
        fn get_size(&self, key: &str) -> Result<u64> {
            self.inner.get_size(key)
        }
    }

    fn cached() -> (tempfile::TempDir, CachedStorage<Counting>) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Counting {
            inner: LocalStorage::new(dir.path().join("store")).unwrap(),
            reads: AtomicUsize::new(0),
        };
        let cache = ContentCache::open(&dir.path().join("cache"), 1024 * 1024).unwrap();
        (dir, CachedStorage::new(backend, cache))
    }

    fn reads(storage: &CachedStorage<Counting>) -> usize {
        storage.inner().reads.load(Ordering::SeqCst)
    }

    #[test]
    fn second_read_is_served_from_cache() {
        let (_dir, storage) = cached();
        storage.put_content("images/a/json", b"{}").unwrap();
        assert_eq!(storage.get_content("images/a/json").unwrap(), b"{}");
        assert_eq!(storage.get_content("images/a/json").unwrap(), b"{}");
        assert_eq!(reads(&storage), 1);
    }

    #[test]
    fn writes_invalidate_without_populating() {
        let (_dir, storage) = cached();
        storage.put_content("images/a/json", b"one").unwrap();
        storage.get_content("images/a/json").unwrap();
        storage.put_content("images/a/json", b"two").unwrap();
        assert_eq!(storage.get_content("images/a/json").unwrap(), b"two");
        assert_eq!(reads(&storage), 2);
    }

    #[test]
    fn remove_evicts() {
        let (_dir, storage) = cached();
        storage.put_content("images/a/checksum", b"sha256:aaa").unwrap();
        storage.get_content("images/a/checksum").unwrap();
        storage.remove("images/a/checksum").unwrap();
        assert!(storage.get_content("images/a/checksum").unwrap_err().is_not_found());
        assert!(!storage.exists("images/a/checksum").unwrap());
    }

    #[test]
    fn layers_and_marks_bypass_the_cache() {
        let (_dir, storage) = cached();
        storage.put_content("images/a/layer", b"tar").unwrap();
        storage.put_content("images/a/_inprogress", b"true").unwrap();
        for _ in 0..2 {
            storage.get_content("images/a/layer").unwrap();
            storage.get_content("images/a/_inprogress").unwrap();
        }
        assert_eq!(reads(&storage), 4);
    }

    #[test]
    fn shared_cache_sees_invalidation_from_any_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStorage::new(dir.path().join("store")).unwrap();
        let cache = ContentCache::open(&dir.path().join("cache"), 1024 * 1024).unwrap();
        let reader = CachedStorage::new(local.clone(), cache.clone());
        let writer = CachedStorage::new(local, cache);
        writer.put_content("images/a/json", b"one").unwrap();
        assert_eq!(reader.get_content("images/a/json").unwrap(), b"one");
        writer.put_content("images/a/json", b"two").unwrap();
        assert_eq!(reader.get_content("images/a/json").unwrap(), b"two");
    }

    #[test]
    fn uncacheable_writes_are_not_tracked() {
        let (_dir, storage) = cached();
        storage.put_content("images/a/layer", b"tar").unwrap();
        storage.put_content("images/a/_inprogress", b"true").unwrap();
        storage.remove("images/a/_inprogress").unwrap();
        assert_eq!(storage.cache.tracked(), 0);
        storage.put_content("images/a/json", b"{}").unwrap();
        assert_eq!(storage.cache.tracked(), 1);
    }

    #[test]
    fn generations_stay_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalStorage::new(dir.path().join("store")).unwrap();
        let cache = ContentCache::open(&dir.path().join("cache"), 1024 * 1024)
            .unwrap()
            .with_tracking_limit(4);
        let storage = CachedStorage::new(backend, cache.clone());

        storage.put_content("images/keep/json", b"old").unwrap();
        assert_eq!(storage.get_content("images/keep/json").unwrap(), b"old");
        for i in 0..20 {
            storage
                .put_content(&format!("images/{}/json", i), b"{}")
                .unwrap();
            assert!(cache.tracked() <= 4);
        }
        // written behind the cache's back, only a reset can make this visible
        storage.inner().put_content("images/keep/json", b"new").unwrap();
        assert_eq!(storage.get_content("images/keep/json").unwrap(), b"new");
        assert_eq!(storage.get_content("images/5/json").unwrap(), b"{}");
    }

    #[test]
    fn metadata_policy() {
        assert!(MetadataOnly.cacheable("images/a/json"));
        assert!(MetadataOnly.cacheable("images/a/ancestry"));
        assert!(!MetadataOnly.cacheable("images/a/layer"));
        assert!(!MetadataOnly.cacheable("images/a/_inprogress"));
    }
}
