//! In-process tier backed by moka.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cacheguard_core::{CacheKey, MAX_TTL};
use moka::Expiry;
use moka::future::Cache;

use super::{CacheStats, Expiration, TierKind, TierStrategy};
use crate::error::{CacheError, CacheResult};
use crate::metrics;

#[derive(Clone, Debug)]
struct LocalEntry {
    data: Arc<Vec<u8>>,
    ttl: Option<Duration>,
    refresh_on_read: bool,
}

/// Per-entry expiry: each entry carries its own TTL, and entries stored
/// with `refresh_on_read` get their full TTL back on every read.
struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_read(
        &self,
        _key: &String,
        value: &LocalEntry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        if value.refresh_on_read {
            value.ttl
        } else {
            duration_until_expiry
        }
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Bounded in-process cache with variable per-entry TTL.
///
/// Cloning is cheap and clones share entries, so the same tier can be held
/// by a [`TwoTier`](super::TwoTier) and an invalidation listener.
#[derive(Clone)]
pub struct LocalTier {
    cache: Cache<String, LocalEntry>,
    default_ttl: Duration,
    counters: Arc<Counters>,
}

impl LocalTier {
    /// `default_ttl` applies to promoted entries and caps two-tier writes.
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry)
            .support_invalidation_closures()
            .build();

        Self {
            cache,
            default_ttl,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions so counts and expiry are up to date.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Store a remote hit under the local default TTL.
    pub async fn promote(&self, key: &str, data: Arc<Vec<u8>>) {
        self.insert(key, data, Expiration::after(self.default_ttl))
            .await;
    }

    async fn insert(&self, key: &str, data: Arc<Vec<u8>>, expiration: Expiration) {
        let entry = LocalEntry {
            data,
            ttl: expiration.ttl.map(|ttl| ttl.min(MAX_TTL)),
            refresh_on_read: expiration.refresh_on_read,
        };
        self.cache.insert(key.to_string(), entry).await;
    }

    /// Remove one raw key.
    pub async fn remove(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Remove every key under `namespace` (`{prefix}:{namespace}`).
    pub fn remove_namespace(&self, namespace: &str) -> CacheResult<()> {
        let prefix = format!("{namespace}:");
        self.cache
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
            .map(|_| ())
            .map_err(|e| CacheError::configuration(format!("local tier clear failed: {e}")))
    }

    /// Lookup without touching the hit/miss counters.
    pub async fn peek(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.cache.get(key).await.map(|entry| entry.data)
    }
}

#[async_trait]
impl TierStrategy for LocalTier {
    fn kind(&self) -> TierKind {
        TierKind::Local
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Arc<Vec<u8>>>> {
        match self.cache.get(key.as_str()).await {
            Some(entry) => {
                tracing::debug!(key = %key, "cache hit (local)");
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_hit("local");
                Ok(Some(entry.data))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_miss("local");
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        key: &CacheKey,
        value: Arc<Vec<u8>>,
        expiration: Expiration,
    ) -> CacheResult<()> {
        self.insert(key.as_str(), value, expiration).await;
        metrics::set_cache_entries("local", self.cache.entry_count());
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        self.remove(key.as_str()).await;
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> CacheResult<()> {
        self.remove_namespace(namespace)?;
        tracing::debug!(namespace = %namespace, "local namespace cleared");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            local_entries: Some(self.cache.entry_count()),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }
}
