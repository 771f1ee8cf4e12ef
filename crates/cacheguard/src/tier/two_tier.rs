//! Local tier in front of the remote tier.

use std::sync::Arc;

use async_trait::async_trait;
use cacheguard_core::CacheKey;

use super::pubsub::{InvalidationListener, InvalidationMessage, publish_invalidation};
use super::{CacheStats, Expiration, LocalTier, RemoteTier, TierKind, TierStrategy};
use crate::error::CacheResult;

/// Two-tier strategy.
///
/// | Operation | Order                                                     |
/// |-----------|-----------------------------------------------------------|
/// | get       | local, then remote; remote hits promoted to local         |
/// | put       | remote, then local (local TTL capped at its default)      |
/// | evict     | remote, then local, then publish an invalidation          |
/// | clear     | remote, then local, then publish an invalidation          |
#[derive(Clone)]
pub struct TwoTier {
    local: LocalTier,
    remote: RemoteTier,
    channel: String,
}

impl TwoTier {
    pub fn new(local: LocalTier, remote: RemoteTier, channel: impl Into<String>) -> Self {
        Self {
            local,
            remote,
            channel: channel.into(),
        }
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn remote(&self) -> &RemoteTier {
        &self.remote
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Listener keeping this instance's local tier in sync with other instances.
    pub fn invalidation_listener(&self) -> InvalidationListener {
        InvalidationListener {
            store: self.remote.store().clone(),
            channel: self.channel.clone(),
            local: self.local.clone(),
        }
    }

    fn local_expiration(&self, expiration: Expiration) -> Expiration {
        let cap = self.local.default_ttl();
        Expiration {
            ttl: Some(expiration.ttl.map_or(cap, |ttl| ttl.min(cap))),
            refresh_on_read: expiration.refresh_on_read,
        }
    }

    async fn publish(&self, message: InvalidationMessage) {
        publish_invalidation(self.remote.store(), &self.channel, &message).await;
    }
}

#[async_trait]
impl TierStrategy for TwoTier {
    fn kind(&self) -> TierKind {
        TierKind::TwoTier
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Arc<Vec<u8>>>> {
        if let Some(data) = self.local.get(key).await? {
            return Ok(Some(data));
        }
        match self.remote.get(key).await? {
            Some(data) => {
                self.local.promote(key.as_str(), Arc::clone(&data)).await;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &CacheKey,
        value: Arc<Vec<u8>>,
        expiration: Expiration,
    ) -> CacheResult<()> {
        self.remote.put(key, Arc::clone(&value), expiration).await?;
        self.local
            .put(key, value, self.local_expiration(expiration))
            .await
    }

    async fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        self.remote.evict(key).await?;
        self.local.evict(key).await?;
        self.publish(InvalidationMessage::Evict {
            key: key.as_str().to_string(),
        })
        .await;
        Ok(())
    }

    async fn evict_many(&self, keys: &[CacheKey]) -> CacheResult<()> {
        self.remote.evict_many(keys).await?;
        for key in keys {
            self.local.evict(key).await?;
            self.publish(InvalidationMessage::Evict {
                key: key.as_str().to_string(),
            })
            .await;
        }
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> CacheResult<()> {
        self.remote.clear(namespace).await?;
        self.local.clear(namespace).await?;
        self.publish(InvalidationMessage::Clear {
            namespace: namespace.to_string(),
        })
        .await;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let local = self.local.stats();
        let remote = self.remote.stats();
        CacheStats {
            local_entries: local.local_entries,
            hits: local.hits + remote.hits,
            misses: remote.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cacheguard_core::{DynStore, KeyGenerator, MemoryStore, RemoteStore};
    use std::time::Duration;

    fn two_tier(store: Arc<MemoryStore>, local_ttl: Duration) -> TwoTier {
        let remote: DynStore = store;
        TwoTier::new(
            LocalTier::new(100, local_ttl),
            RemoteTier::new(remote),
            "app:invalidate",
        )
    }

    #[tokio::test]
    async fn test_remote_hit_is_promoted() {
        let store = Arc::new(MemoryStore::new());
        let tier = two_tier(store.clone(), Duration::from_secs(60));
        let key = KeyGenerator::new("app").key("user", "7");

        store.set(key.as_str(), b"remote", None).await.unwrap();
        assert!(tier.local().peek(key.as_str()).await.is_none());

        let first = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(first.as_slice(), b"remote");
        assert!(tier.local().peek(key.as_str()).await.is_some());

        // Served locally even after the remote copy is gone.
        store.delete(&[key.as_str().to_string()]).await.unwrap();
        assert!(tier.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_ttl_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let tier = two_tier(store.clone(), Duration::from_millis(50));
        let key = KeyGenerator::new("app").key("user", "8");

        tier.put(&key, Arc::new(b"v".to_vec()), Expiration::after(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store.ttl(key.as_str()).unwrap() > Duration::from_secs(55));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(tier.local().peek(key.as_str()).await.is_none());
        // Falls through to the remote copy.
        assert!(tier.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_evict_removes_both_tiers() {
        let store = Arc::new(MemoryStore::new());
        let tier = two_tier(store.clone(), Duration::from_secs(60));
        let key = KeyGenerator::new("app").key("user", "9");

        tier.put(&key, Arc::new(b"v".to_vec()), Expiration::never())
            .await
            .unwrap();
        tier.evict(&key).await.unwrap();

        assert!(store.get(key.as_str()).await.unwrap().is_none());
        assert!(tier.local().peek(key.as_str()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidation_reaches_other_instance() {
        let store = Arc::new(MemoryStore::new());
        let a = two_tier(store.clone(), Duration::from_secs(60));
        let b = two_tier(store.clone(), Duration::from_secs(60));
        let listener = b.invalidation_listener().start();
        let key = KeyGenerator::new("app").key("user", "10");

        a.put(&key, Arc::new(b"v1".to_vec()), Expiration::never())
            .await
            .unwrap();
        // b caches the value locally.
        assert!(b.get(&key).await.unwrap().is_some());

        let mut evicted = false;
        for _ in 0..100 {
            a.evict(&key).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            if b.local().peek(key.as_str()).await.is_none() {
                evicted = true;
                break;
            }
        }
        assert!(evicted);
        assert!(b.get(&key).await.unwrap().is_none());

        listener.abort();
    }
}
