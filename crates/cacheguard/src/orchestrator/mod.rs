//! Cache-aside orchestration.
//!
//! ## Read-through flow
//!
//! ```text
//! lookup ─ hit ──────────────────────────────────────────────→ value
//!   │       sentinel ────────────────────────────────────────→ None
//!   miss
//!   ↓
//! in-process gate (one caller per key per process)
//!   ↓ re-read
//! distributed lock on {key}:lock (one caller per key overall)
//!   ↓ re-read
//! compute → store value or null sentinel → release lock
//! ```
//!
//! When the lock can't be acquired within the retry budget the caller reads
//! the cache once more and returns whatever is there, possibly `None`.

pub mod policy;

use std::future::Future;
use std::sync::Arc;

use cacheguard_core::{
    CacheKey, Codec, InvocationContext, KeyGenerator, NULL_SENTINEL, is_null_sentinel,
};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::config::CacheSettings;
use crate::error::{CacheError, CacheResult};
use crate::lock::DistributedLock;
use crate::metrics;
use crate::registry::{DynTier, StrategyRegistry};
use crate::tier::{CacheStats, Expiration, TierKind};

pub use policy::{
    CachePolicy, InvalidateMany, InvalidateOne, ReadThrough, Selection, Ttl, WriteThrough,
};

/// One caller's handle on the in-process gate of a key. Dropping it, on
/// completion or cancellation, removes the map entry once no other caller
/// holds the gate.
struct Gate<'a> {
    in_flight: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    mutex: Arc<Mutex<()>>,
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        // The map's handle plus this one.
        self.in_flight
            .remove_if(self.key, |_, gate| Arc::strong_count(gate) == 2);
    }
}

/// Applies caching policies to units of work.
///
/// Compute closures return `Result<Option<T>, E>`: `Ok(None)` means "no
/// data exists" and is cached as the null sentinel so repeated lookups of
/// missing data don't reach the source. Compute errors are returned
/// unchanged and nothing is cached for them.
pub struct CacheOrchestrator {
    registry: Arc<StrategyRegistry>,
    lock: DistributedLock,
    keys: KeyGenerator,
    codec: Codec,
    settings: CacheSettings,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl CacheOrchestrator {
    pub fn new(registry: Arc<StrategyRegistry>, lock: DistributedLock, settings: CacheSettings) -> Self {
        Self {
            registry,
            lock,
            keys: KeyGenerator::new(settings.key_prefix.clone()),
            codec: settings.codec,
            settings,
            in_flight: DashMap::new(),
        }
    }

    pub fn keys(&self) -> &KeyGenerator {
        &self.keys
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub fn stats(&self) -> Vec<(TierKind, CacheStats)> {
        self.registry.stats()
    }

    /// Read-through: cached value if present, otherwise compute it once
    /// across all processes and store the result.
    pub async fn cached<T, E, F, Fut>(
        &self,
        policy: &ReadThrough,
        ctx: &InvocationContext,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send,
        E: From<CacheError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, E>> + Send,
    {
        let tier = self.registry.resolve(policy.tier)?;
        let key = self.keys.resolve(&policy.namespace, &policy.key, ctx);

        if let Some(hit) = self.lookup::<T>(tier, &key).await? {
            return Ok(hit);
        }

        let gate = self.gate(&key);
        let _permit = gate.mutex.lock().await;
        self.fill(tier, &key, policy, compute).await
    }

    async fn fill<T, E, F, Fut>(
        &self,
        tier: &DynTier,
        key: &CacheKey,
        policy: &ReadThrough,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send,
        E: From<CacheError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, E>> + Send,
    {
        // Filled by another caller of this process while we waited at the gate.
        if let Some(hit) = self.lookup::<T>(tier, key).await? {
            return Ok(hit);
        }

        self.lock
            .with_lock::<Option<T>, E>(self.lock.lock_key(key))
            .degrade_on_store_error(self.settings.degrade_on_store_error)
            .on_lock_fail(move || async move {
                tracing::debug!(key = %key, "lock busy, returning current cache content");
                let current = self.lookup::<T>(tier, key).await?;
                Ok::<_, E>(current.flatten())
            })
            .run(move || async move {
                if let Some(hit) = self.lookup::<T>(tier, key).await? {
                    return Ok(hit);
                }
                tracing::debug!(key = %key, "cache miss, computing");
                metrics::record_computation(&policy.namespace);
                let value = compute().await?;
                let (payload, expiration) =
                    self.payload(key, value.as_ref(), policy.ttl, policy.refresh_on_read)?;
                self.put(tier, key, payload, expiration).await?;
                Ok::<_, E>(value)
            })
            .await
    }

    /// Write-through: always compute, then overwrite the entry.
    pub async fn cache_put<T, E, F, Fut>(
        &self,
        policy: &WriteThrough,
        ctx: &InvocationContext,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + Send,
        E: From<CacheError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, E>> + Send,
    {
        let tier = self.registry.resolve(policy.tier)?;
        let key = self.keys.resolve(&policy.namespace, &policy.key, ctx);

        let value = compute().await?;
        let (payload, expiration) =
            self.payload(&key, value.as_ref(), policy.ttl, policy.refresh_on_read)?;
        self.put(tier, &key, payload, expiration).await?;
        tracing::debug!(key = %key, "cache entry written through");
        Ok(value)
    }

    /// Compute, then delete one entry.
    pub async fn cache_del<T, E, F, Fut>(
        &self,
        policy: &InvalidateOne,
        ctx: &InvocationContext,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Send,
        E: From<CacheError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, E>> + Send,
    {
        let key = self.keys.resolve(&policy.namespace, &policy.key, ctx);
        let value = compute().await?;
        self.evict(&key, policy.tier).await?;
        Ok(value)
    }

    /// Compute, then delete the selected entries or the whole namespace.
    pub async fn cache_dels<T, E, F, Fut>(
        &self,
        policy: &InvalidateMany,
        ctx: &InvocationContext,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Send,
        E: From<CacheError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, E>> + Send,
    {
        let value = compute().await?;
        match &policy.selection {
            Selection::Keys(exprs) => {
                let keys: Vec<CacheKey> = exprs
                    .iter()
                    .map(|expr| self.keys.resolve(&policy.namespace, expr, ctx))
                    .collect();
                self.evict_many(&keys, policy.tier).await?;
            }
            Selection::AllEntries => {
                self.clear(&policy.namespace, policy.tier).await?;
            }
        }
        Ok(value)
    }

    /// Apply whichever policy is given.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        policy: &CachePolicy,
        ctx: &InvocationContext,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send,
        E: From<CacheError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, E>> + Send,
    {
        match policy {
            CachePolicy::ReadThrough(p) => self.cached(p, ctx, compute).await,
            CachePolicy::WriteThrough(p) => self.cache_put(p, ctx, compute).await,
            CachePolicy::InvalidateOne(p) => self.cache_del(p, ctx, compute).await,
            CachePolicy::InvalidateMany(p) => self.cache_dels(p, ctx, compute).await,
        }
    }

    /// Delete one entry.
    pub async fn evict(&self, key: &CacheKey, tier: Option<TierKind>) -> CacheResult<()> {
        let result = self.registry.resolve(tier)?.evict(key).await;
        self.tolerate(result, key.as_str(), "evict")?;
        tracing::debug!(key = %key, "cache entry evicted");
        Ok(())
    }

    pub async fn evict_many(&self, keys: &[CacheKey], tier: Option<TierKind>) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let result = self.registry.resolve(tier)?.evict_many(keys).await;
        self.tolerate(result, keys[0].namespace(), "evict_many")
    }

    /// Delete every entry of `namespace`.
    pub async fn clear(&self, namespace: &str, tier: Option<TierKind>) -> CacheResult<()> {
        let namespace_key = self.keys.namespace_key(namespace);
        let result = self.registry.resolve(tier)?.clear(&namespace_key).await;
        self.tolerate(result, &namespace_key, "clear")?;
        tracing::info!(namespace = %namespace_key, "cache namespace cleared");
        Ok(())
    }

    fn gate<'a>(&'a self, key: &'a CacheKey) -> Gate<'a> {
        let mutex = Arc::clone(&self.in_flight.entry(key.as_str().to_string()).or_default());
        Gate {
            in_flight: &self.in_flight,
            key: key.as_str(),
            mutex,
        }
    }

    /// `None` on a miss, `Some(None)` on a null sentinel.
    async fn lookup<T: DeserializeOwned>(
        &self,
        tier: &DynTier,
        key: &CacheKey,
    ) -> CacheResult<Option<Option<T>>> {
        let payload = match tier.get(key).await {
            Ok(payload) => payload,
            Err(CacheError::StoreUnavailable(e)) if self.settings.degrade_on_store_error => {
                tracing::warn!(key = %key, error = %e, "cache read failed, treating as miss");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match payload {
            None => Ok(None),
            Some(bytes) if is_null_sentinel(&bytes) => {
                tracing::debug!(key = %key, "null sentinel hit");
                Ok(Some(None))
            }
            Some(bytes) => self
                .codec
                .decode::<T>(&bytes)
                .map(|value| Some(Some(value)))
                .map_err(|e| CacheError::serialization(key.as_str(), e)),
        }
    }

    fn payload<T: Serialize>(
        &self,
        key: &CacheKey,
        value: Option<&T>,
        ttl: Ttl,
        refresh_on_read: bool,
    ) -> CacheResult<(Arc<Vec<u8>>, Expiration)> {
        let ttl = match ttl {
            Ttl::Never => None,
            Ttl::Default => Some(self.settings.default_ttl()),
            Ttl::After(ttl) => Some(ttl),
        };
        match value {
            Some(value) => {
                let bytes = self
                    .codec
                    .encode(value)
                    .map_err(|e| CacheError::serialization(key.as_str(), e))?;
                Ok((
                    Arc::new(bytes),
                    Expiration {
                        ttl,
                        refresh_on_read,
                    },
                ))
            }
            None => Ok((
                Arc::new(NULL_SENTINEL.to_vec()),
                Expiration {
                    ttl: self.settings.null_ttl().or(ttl),
                    refresh_on_read: false,
                },
            )),
        }
    }

    async fn put(
        &self,
        tier: &DynTier,
        key: &CacheKey,
        payload: Arc<Vec<u8>>,
        expiration: Expiration,
    ) -> CacheResult<()> {
        let result = tier.put(key, payload, expiration).await;
        self.tolerate(result, key.as_str(), "put")
    }

    fn tolerate(&self, result: CacheResult<()>, key: &str, op: &'static str) -> CacheResult<()> {
        match result {
            Err(CacheError::StoreUnavailable(e)) if self.settings.degrade_on_store_error => {
                tracing::warn!(key = %key, op, error = %e, "cache write failed, continuing");
                Ok(())
            }
            other => other,
        }
    }
}
