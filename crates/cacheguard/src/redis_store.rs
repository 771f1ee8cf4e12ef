//! Redis implementation of the remote store contract.
//!
//! Pooled connections (deadpool) serve every command; pub/sub uses a
//! dedicated client because a subscribed connection can't be returned to
//! the pool. Lock release and rate limiting run as server-side Lua scripts so
//! each is a single atomic round trip.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use cacheguard_core::{
    DynStore, MAX_TTL, MemoryStore, RemoteStore, StoreError, StoreResult, window_secs,
};
use deadpool_redis::Pool;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::AsyncCommands;

use crate::config::RedisConfig;

/// Deletes the lock only while it still holds the caller's token.
pub const RELEASE_LOCK_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Fixed-window counter: returns 0 when denied, otherwise the new count.
pub const RATE_LIMIT_SCRIPT: &str = r#"local key = KEYS[1]; local count = tonumber(ARGV[1]); local interval = tonumber(ARGV[2])
local current = tonumber(redis.call('get', key) or "0")
if current + 1 > count then return 0
else redis.call("INCRBY", key, "1") redis.call("expire", key, interval) return current + 1 end"#;

static RELEASE_LOCK: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(RELEASE_LOCK_SCRIPT));
static RATE_LIMIT: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(RATE_LIMIT_SCRIPT));

const SCAN_BATCH: usize = 500;

fn command_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::connection(e.to_string())
    } else {
        StoreError::command(e.to_string())
    }
}

fn script_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::connection(e.to_string())
    } else {
        StoreError::script(e.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

/// Remote store backed by a Redis connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    url: String,
}

impl RedisStore {
    pub fn new(pool: Pool, url: impl Into<String>) -> Self {
        Self {
            pool,
            url: url.into(),
        }
    }

    /// Build a pool from configuration without connecting.
    pub fn from_config(config: &RedisConfig) -> StoreResult<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| StoreError::pool(e.to_string()))?;
        Ok(Self::new(pool, config.url.clone()))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::pool(format!("failed to get Redis connection: {e}")))
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(command_error)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(command_error)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.del::<_, u64>(keys).await.map_err(command_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(updated == 1)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = RELEASE_LOCK
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(script_error)?;
        Ok(deleted == 1)
    }

    async fn increment_within_quota(
        &self,
        key: &str,
        quota: u64,
        window: Duration,
    ) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let count: i64 = RATE_LIMIT
            .key(key)
            .arg(quota)
            .arg(window_secs(window))
            .invoke_async(&mut conn)
            .await
            .map_err(script_error)?;
        Ok(count.max(0) as u64)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(command_error)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| StoreError::connection(format!("failed to create Redis client: {e}")))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::connection(format!("failed to get pub/sub connection: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| StoreError::command(format!("failed to subscribe: {e}")))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse pub/sub message payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }
}

/// Create the remote store based on configuration.
///
/// - **Redis disabled**: in-process store, the instance coordinates only with itself
/// - **Redis enabled**: connects and verifies the pool. An unreachable Redis is
///   an error unless `fallback_to_memory` is set
pub async fn create_remote_store(config: &RedisConfig) -> StoreResult<DynStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    match connect_redis(config).await {
        Ok(store) => {
            tracing::info!("Connected to Redis");
            Ok(store)
        }
        Err(e) if config.fallback_to_memory => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-process store."
            );
            Ok(Arc::new(MemoryStore::new()))
        }
        Err(e) => {
            tracing::error!(error = %e, url = %config.url, "Failed to connect to Redis");
            Err(e)
        }
    }
}

/// Connect to Redis or fail; no fallback.
pub async fn connect_redis(config: &RedisConfig) -> StoreResult<DynStore> {
    let store = RedisStore::from_config(config)?;
    store.ping().await?;
    Ok(Arc::new(store))
}
