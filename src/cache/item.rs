//! The on-disk unit of cached content.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single stored response body, content-addressed by its sha256 hash.
/// Several `CacheKey`s may share the same `CacheItem` when their bodies
/// are byte-identical (SPEC_FULL.md §4.E, Property 4).
pub struct CacheItem {
    pub file_path: PathBuf,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub size: u64,
    pub hash: String,
    pub created_at: i64,
    last_access: AtomicI64,
    access_count: AtomicU64,
}

impl CacheItem {
    pub fn new(
        file_path: PathBuf,
        content_type: String,
        content_encoding: Option<String>,
        size: u64,
        hash: String,
    ) -> Self {
        let now = now_secs();
        Self {
            file_path,
            content_type,
            content_encoding,
            size,
            hash,
            created_at: now,
            last_access: AtomicI64::new(now),
            access_count: AtomicU64::new(0),
        }
    }

    pub fn last_access(&self) -> i64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Records a read: bumps `LastAccess` to now and increments the
    /// access counter. Freshness is based on `LastAccess`, not
    /// `CreatedAt` (SPEC_FULL.md §9).
    pub fn touch(&self) {
        self.last_access.store(now_secs(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_stale(&self, max_age: std::time::Duration) -> bool {
        let age = now_secs() - self.last_access();
        age as u64 > max_age.as_secs()
    }

    pub fn exists_on_disk(&self) -> bool {
        self.file_path.is_file()
    }
}
