//! Shared tier over the remote store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cacheguard_core::{CacheKey, DynStore};

use super::{CacheStats, Expiration, TierKind, TierStrategy};
use crate::error::CacheResult;
use crate::metrics;

#[derive(Clone)]
pub struct RemoteTier {
    store: DynStore,
    lock_suffix: Option<Arc<str>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl RemoteTier {
    pub fn new(store: DynStore) -> Self {
        Self {
            store,
            lock_suffix: None,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Keys ending in `suffix` are lock records and survive [`TierStrategy::clear`].
    pub fn with_lock_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.lock_suffix = Some(Arc::from(suffix.into()));
        self
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }
}

#[async_trait]
impl TierStrategy for RemoteTier {
    fn kind(&self) -> TierKind {
        TierKind::Remote
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Arc<Vec<u8>>>> {
        match self.store.get(key.as_str()).await? {
            Some(data) => {
                tracing::debug!(key = %key, "cache hit (remote)");
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_hit("remote");
                Ok(Some(Arc::new(data)))
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_miss("remote");
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
        self.store
            .set(key.as_str(), value.as_slice(), expiration.ttl)
            .await?;
        tracing::debug!(
            key = %key,
            ttl_ms = expiration.ttl.map(|t| t.as_millis() as u64),
            "cache set (remote)"
        );
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        self.store.delete(&[key.as_str().to_string()]).await?;
        Ok(())
    }

    async fn evict_many(&self, keys: &[CacheKey]) -> CacheResult<()> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        self.store.delete(&keys).await?;
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> CacheResult<()> {
        let mut keys = self.store.scan(&format!("{namespace}:*")).await?;
        if let Some(suffix) = self.lock_suffix.as_deref() {
            keys.retain(|key| !key.ends_with(suffix));
        }
        let removed = self.store.delete(&keys).await?;
        tracing::debug!(namespace = %namespace, removed, "remote namespace cleared");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            local_entries: None,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
