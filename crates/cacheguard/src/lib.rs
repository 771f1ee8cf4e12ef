pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod rate_limit;
pub mod redis_store;
pub mod registry;
pub mod tier;

use std::sync::Arc;

use cacheguard_core::DynStore;
use tokio::task::JoinHandle;

pub use cacheguard_core::{
    CacheKey, Codec, InvocationContext, KeyExpr, KeyGenerator, MemoryStore, RemoteStore,
    RetryBudget, StoreError,
};
pub use config::{
    CacheGuardConfig, CacheSettings, LockSettings, LoggingConfig, RateLimitSettings, RedisConfig,
};
pub use error::{CacheError, CacheResult, ErrorCategory};
pub use lock::{DistributedLock, LockGuard, LockRecord, LockTask};
pub use observability::{init_tracing, init_tracing_with_level};
pub use orchestrator::{
    CacheOrchestrator, CachePolicy, InvalidateMany, InvalidateOne, ReadThrough, Selection, Ttl,
    WriteThrough,
};
pub use rate_limit::{
    LimitScope, RateLimitDecision, RateLimitRequest, RateLimitRule, RateLimiter,
};
pub use redis_store::{RedisStore, connect_redis, create_remote_store};
pub use registry::StrategyRegistry;
pub use tier::{CacheStats, Expiration, LocalTier, RemoteTier, TierKind, TierStrategy, TwoTier};

/// Every engine component wired to one remote store.
///
/// Cloning the handles is cheap; build one `CacheGuard` per process and
/// share it.
pub struct CacheGuard {
    pub store: DynStore,
    pub lock: DistributedLock,
    pub rate_limiter: RateLimiter,
    pub orchestrator: Arc<CacheOrchestrator>,
    listener: Option<JoinHandle<()>>,
}

impl CacheGuard {
    /// Connect the remote store described by `config` and build the engine.
    ///
    /// ## Graceful Degradation
    ///
    /// If Redis is disabled, or unreachable with `redis.fallback_to_memory`
    /// set, the engine runs on an in-process store and only coordinates with
    /// this process. Otherwise an unreachable Redis is
    /// [`CacheError::StoreUnavailable`].
    pub async fn connect(config: &CacheGuardConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::configuration)?;
        let store = create_remote_store(&config.redis).await?;
        Ok(Self::with_store(store, config))
    }

    /// Build the engine over an existing store and start the cross-instance
    /// invalidation listener. Must be called within a Tokio runtime.
    pub fn with_store(store: DynStore, config: &CacheGuardConfig) -> Self {
        let registry = Arc::new(StrategyRegistry::from_config(store.clone(), config));
        let listener = registry
            .two_tier()
            .map(|two_tier| two_tier.invalidation_listener().start());

        let lock = DistributedLock::new(store.clone(), config.lock.clone());
        let orchestrator = Arc::new(CacheOrchestrator::new(
            registry,
            lock.clone(),
            config.cache.clone(),
        ));
        let rate_limiter = RateLimiter::new(store.clone(), &config.rate_limit);

        tracing::info!(
            store = store.name(),
            prefix = %config.cache.key_prefix,
            default_tier = %config.cache.default_tier,
            codec = config.cache.codec.name(),
            "cacheguard initialized"
        );

        Self {
            store,
            lock,
            rate_limiter,
            orchestrator,
            listener,
        }
    }

    /// Stop background tasks.
    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
