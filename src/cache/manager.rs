//! Two-tier, content-addressed response cache (SPEC_FULL.md §4.E).
//!
//! Grounded in the teacher's concurrency idioms — a `DashMap` for the
//! concurrently-accessed cold tier, atomics for counters, a
//! `tokio::sync::watch` controlled background ticker for cleanup (as in
//! the teacher's health-check executor) — generalized from "route
//! plugin state" to "stored HTTP response bodies".

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::watch;

use crate::cache::{item::CacheItem, key::CacheKey};
use crate::config::CacheConfig;
use crate::core::{ProxyError, ProxyResult};

const DEFAULT_HOT_CAPACITY: usize = 10_000;

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub items: usize,
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub bytes_saved: u64,
    pub format_fallback_hits: u64,
}

pub struct CacheManager {
    dir: PathBuf,
    enabled: AtomicBool,
    hot: Mutex<LruCache<CacheKey, Arc<CacheItem>>>,
    cold: DashMap<CacheKey, Arc<CacheItem>>,
    /// Secondary index by content hash, the dedup point of truth.
    hash_index: DashMap<String, Arc<CacheItem>>,
    max_age_secs: AtomicU64,
    max_cache_size_bytes: AtomicU64,
    cleanup_tick: watch::Sender<std::time::Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_saved: AtomicU64,
    format_fallback_hits: AtomicU64,
    temp_counter: AtomicU64,
}

impl CacheManager {
    pub fn new(dir: impl Into<PathBuf>, config: CacheConfig) -> ProxyResult<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ProxyError::CacheIo(format!("creating cache dir: {e}")))?;

        let manager = Arc::new(Self {
            dir,
            enabled: AtomicBool::new(true),
            hot: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(DEFAULT_HOT_CAPACITY).unwrap(),
            )),
            cold: DashMap::new(),
            hash_index: DashMap::new(),
            max_age_secs: AtomicU64::new(config.max_age().as_secs()),
            max_cache_size_bytes: AtomicU64::new(config.max_cache_size_bytes()),
            cleanup_tick: watch::channel(config.cleanup_tick()).0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
            format_fallback_hits: AtomicU64::new(0),
            temp_counter: AtomicU64::new(0),
        });
        manager.sweep_stale_on_startup();
        Ok(manager)
    }

    /// Every content file in the cache directory is orphaned the moment
    /// the process restarts, because the index (`CacheKey`/`CacheItem`
    /// map) lives only in memory: nothing on disk records which hash
    /// belongs to which key. So a fresh process starts with an empty,
    /// reclaimed cache directory (SPEC_FULL.md §4.E "Stale files").
    fn sweep_stale_on_startup(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cache: failed to read cache dir on startup: {e}");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == "config.json" {
                continue;
            }
            if path.is_file() {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("cache: failed to remove stale file {path:?}: {e}");
                }
            }
        }
    }

    fn max_age(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_age_secs.load(Ordering::Relaxed))
    }

    fn max_cache_size(&self) -> u64 {
        self.max_cache_size_bytes.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Applies a new configuration. Zero-valued fields mean "keep using
    /// defaults", matching the historical constructor contract.
    pub fn update_config(&self, config: CacheConfig) {
        self.max_age_secs
            .store(config.max_age().as_secs(), Ordering::Relaxed);
        self.max_cache_size_bytes
            .store(config.max_cache_size_bytes(), Ordering::Relaxed);
        let _ = self.cleanup_tick.send(config.cleanup_tick());
    }

    fn is_live(item: &CacheItem, max_age: std::time::Duration) -> bool {
        item.exists_on_disk() && !item.is_stale(max_age)
    }

    /// Removes every trace of one stored body: the hash index entry, the
    /// file on disk, and the one `CacheKey` mapping the caller is
    /// currently looking at (other keys sharing the item are reaped
    /// lazily the next time they are looked up).
    fn evict_one(&self, key: &CacheKey, item: &Arc<CacheItem>) {
        self.cold.remove(key);
        self.hot.lock().unwrap().pop(key);
        if let Some((_, indexed)) = self.hash_index.remove(&item.hash) {
            if Arc::ptr_eq(&indexed, item) {
                let _ = std::fs::remove_file(&indexed.file_path);
            } else {
                // Someone already replaced the index entry; put it back.
                self.hash_index.insert(item.hash.clone(), indexed);
            }
        }
    }

    fn lookup_one(&self, key: &CacheKey) -> Option<Arc<CacheItem>> {
        let max_age = self.max_age();

        if let Some(item) = self.hot.lock().unwrap().get(key).cloned() {
            if Self::is_live(&item, max_age) {
                item.touch();
                return Some(item);
            }
            self.evict_one(key, &item);
            return None;
        }

        if let Some(item) = self.cold.get(key).map(|e| e.value().clone()) {
            if Self::is_live(&item, max_age) {
                item.touch();
                self.hot.lock().unwrap().put(key.clone(), item.clone());
                return Some(item);
            }
            self.evict_one(key, &item);
            return None;
        }

        None
    }

    /// Read path. Returns the hit item and whether it was served via the
    /// image-format fallback walk rather than an exact match.
    pub fn get(&self, key: &CacheKey) -> Option<(Arc<CacheItem>, bool)> {
        if !self.is_enabled() {
            return None;
        }

        if let Some(item) = self.lookup_one(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some((item, false));
        }

        // Image fallback walk: accept any modern-image-format entry under
        // an alternate Accept bucket (SPEC_FULL.md §9: intentional, may
        // surprise strict callers).
        for alt in key.image_accept().fallback_order().iter().skip(1) {
            let alt_key = key.with_accept(*alt);
            if let Some(item) = self.lookup_one(&alt_key) {
                if crate::cache::key::is_modern_image_content_type(&item.content_type) {
                    log::debug!(
                        "cache: format fallback {} -> {} for {}",
                        key.accept,
                        alt_key.accept,
                        key.url
                    );
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.format_fallback_hits.fetch_add(1, Ordering::Relaxed);
                    return Some((item, true));
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Creates a fresh temp file for a streaming write-through commit.
    pub async fn create_temp(&self) -> std::io::Result<(PathBuf, tokio::fs::File)> {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("temp-{}-{:x}", n, rand::random::<u64>());
        let path = self.dir.join(name);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok((path, file))
    }

    /// Commits a completed temp file into the cache, deduplicating by
    /// content hash (SPEC_FULL.md §4.E write path).
    pub fn commit(
        &self,
        key: CacheKey,
        temp_path: PathBuf,
        hash: String,
        size: u64,
        content_type: String,
        content_encoding: Option<String>,
    ) -> ProxyResult<Arc<CacheItem>> {
        if let Some(existing) = self.hash_index.get(&hash).map(|e| e.value().clone()) {
            if existing.exists_on_disk() {
                let _ = std::fs::remove_file(&temp_path);
                self.bytes_saved.fetch_add(size, Ordering::Relaxed);
                self.cold.insert(key.clone(), existing.clone());
                log::debug!("cache: HIT (dedup) for {} -> {}", key.canonical(), hash);
                return Ok(existing);
            }
            // Stale index entry pointing at a deleted file; fall through
            // and replace it below.
        }

        let final_path = self.dir.join(&hash);
        std::fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            ProxyError::CacheIo(format!("renaming temp file: {e}"))
        })?;

        let item = Arc::new(CacheItem::new(
            final_path,
            content_type,
            content_encoding,
            size,
            hash.clone(),
        ));
        self.hash_index.insert(hash.clone(), item.clone());
        self.cold.insert(key.clone(), item.clone());
        log::debug!("cache: NEW {} -> {}", key.canonical(), hash);
        Ok(item)
    }

    pub fn clear(&self) -> ProxyResult<()> {
        self.cold.clear();
        self.hot.lock().unwrap().clear();
        for entry in self.hash_index.iter() {
            let _ = std::fs::remove_file(&entry.value().file_path);
        }
        self.hash_index.clear();
        Ok(())
    }

    pub fn clear_by_prefix(&self, url_prefix: &str) -> ProxyResult<usize> {
        let matching: Vec<CacheKey> = self
            .cold
            .iter()
            .filter(|e| e.key().url.starts_with(url_prefix))
            .map(|e| e.key().clone())
            .collect();

        let count = matching.len();
        for key in &matching {
            self.cold.remove(key);
            self.hot.lock().unwrap().pop(key);
        }

        // Any hash no longer referenced by a remaining cold entry can be
        // deleted from disk.
        let live_hashes: std::collections::HashSet<String> =
            self.cold.iter().map(|e| e.value().hash.clone()).collect();
        let orphaned: Vec<String> = self
            .hash_index
            .iter()
            .filter(|e| !live_hashes.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for hash in orphaned {
            if let Some((_, item)) = self.hash_index.remove(&hash) {
                let _ = std::fs::remove_file(&item.file_path);
            }
        }

        Ok(count)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let size_bytes: u64 = self.hash_index.iter().map(|e| e.value().size).sum();
        CacheStats {
            items: self.cold.len(),
            size_bytes,
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            format_fallback_hits: self.format_fallback_hits.load(Ordering::Relaxed),
        }
    }

    /// One cleanup sweep: evict stale entries then, if still over
    /// budget, evict by oldest `LastAccess` until under the cap
    /// (SPEC_FULL.md §4.E Eviction, Property 7).
    pub fn run_cleanup(&self) {
        let max_age = self.max_age();
        let cap = self.max_cache_size();

        let mut by_hash: Vec<(String, i64, u64)> = self
            .hash_index
            .iter()
            .map(|e| (e.key().clone(), e.value().last_access(), e.value().size))
            .collect();

        let stale: Vec<String> = by_hash
            .iter()
            .filter(|(_, last_access, _)| {
                let age = chrono::Utc::now().timestamp() - last_access;
                age as u64 > max_age.as_secs()
            })
            .map(|(hash, _, _)| hash.clone())
            .collect();

        let mut to_evict: std::collections::HashSet<String> = stale.into_iter().collect();

        let mut total: u64 = by_hash.iter().map(|(_, _, size)| *size).sum();
        if total > cap {
            by_hash.sort_by_key(|(_, last_access, _)| *last_access);
            for (hash, _, size) in &by_hash {
                if total <= cap {
                    break;
                }
                if to_evict.insert(hash.clone()) {
                    total = total.saturating_sub(*size);
                }
            }
        }

        if to_evict.is_empty() {
            return;
        }

        log::info!("cache: cleanup evicting {} entries", to_evict.len());
        for hash in &to_evict {
            if let Some((_, item)) = self.hash_index.remove(hash) {
                let _ = std::fs::remove_file(&item.file_path);
            }
        }

        let stale_keys: Vec<CacheKey> = self
            .cold
            .iter()
            .filter(|e| to_evict.contains(&e.value().hash))
            .map(|e| e.key().clone())
            .collect();
        for key in stale_keys {
            self.cold.remove(&key);
            self.hot.lock().unwrap().pop(&key);
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Spawns the periodic cleanup task. Only one cleanup runs at a time;
    /// `update_config` reuses this same ticker by pushing a new interval
    /// instead of spawning a second loop.
    pub fn spawn_cleanup_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let mut tick_rx = self.cleanup_tick.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(*tick_rx.borrow());
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick_rx.changed() => {
                        interval = tokio::time::interval(*tick_rx.borrow());
                    }
                    _ = interval.tick() => {
                        self.run_cleanup();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_committed(
        manager: &CacheManager,
        key: CacheKey,
        body: &[u8],
        content_type: &str,
    ) -> Arc<CacheItem> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(body);
        let hash = format!("{:x}", hasher.finalize());

        let tmp_path = manager.dir().join(format!("temp-test-{}", rand::random::<u64>()));
        let mut f = std::fs::File::create(&tmp_path).unwrap();
        f.write_all(body).unwrap();
        drop(f);

        manager
            .commit(
                key,
                tmp_path,
                hash,
                body.len() as u64,
                content_type.to_string(),
                None,
            )
            .unwrap()
    }

    #[test]
    fn content_address_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path(), CacheConfig::default()).unwrap();

        let key_a = CacheKey::raw("/a.bin", "*/*", "ua");
        let key_b = CacheKey::raw("/b.bin", "*/*", "ua");
        let body = b"identical payload bytes";

        let item_a = write_committed(&manager, key_a.clone(), body, "application/octet-stream");
        let item_b = write_committed(&manager, key_b.clone(), body, "application/octet-stream");

        assert!(Arc::ptr_eq(&item_a, &item_b));
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().starts_with("temp-"))
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn hit_and_miss_counted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path(), CacheConfig::default()).unwrap();
        let key = CacheKey::raw("/x", "*/*", "ua");

        assert!(manager.get(&key).is_none());
        write_committed(&manager, key.clone(), b"body", "text/plain");
        let (item, fallback) = manager.get(&key).unwrap();
        assert!(!fallback);
        assert_eq!(item.size, 4);

        let stats = manager.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn image_format_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path(), CacheConfig::default()).unwrap();

        let webp_key = CacheKey::for_image("/img.png", "image/webp", "ua");
        write_committed(&manager, webp_key, b"webpbytes", "image/webp");

        let avif_key = CacheKey::for_image("/img.png", "image/avif,image/webp;q=0.9", "ua");
        let (item, fallback) = manager.get(&avif_key).unwrap();
        assert!(fallback);
        assert_eq!(item.content_type, "image/webp");
    }

    #[test]
    fn clear_by_prefix_removes_only_matching() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path(), CacheConfig::default()).unwrap();

        write_committed(
            &manager,
            CacheKey::raw("/keep/a", "*/*", "ua"),
            b"keep",
            "text/plain",
        );
        write_committed(
            &manager,
            CacheKey::raw("/drop/a", "*/*", "ua"),
            b"drop",
            "text/plain",
        );

        let removed = manager.clear_by_prefix("/drop").unwrap();
        assert_eq!(removed, 1);
        assert!(manager.get(&CacheKey::raw("/keep/a", "*/*", "ua")).is_some());
        assert!(manager.get(&CacheKey::raw("/drop/a", "*/*", "ua")).is_none());
    }
}
