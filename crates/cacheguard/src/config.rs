use cacheguard_core::{Codec, RetryBudget};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tier::TierKind;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheGuardConfig {
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache orchestration and tier settings
    #[serde(default)]
    pub cache: CacheSettings,
    /// Distributed lock settings
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CacheGuardConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.cache.local_max_entries == 0 {
            return Err("cache.local_max_entries must be > 0".into());
        }
        if self.cache.local_ttl_secs == 0 {
            return Err("cache.local_ttl_secs must be > 0".into());
        }
        if self.cache.default_ttl_secs == 0 {
            return Err("cache.default_ttl_secs must be > 0".into());
        }
        if self.lock.ttl_ms == 0 {
            return Err("lock.ttl_ms must be > 0".into());
        }
        if self.lock.initial_backoff_ms == 0 {
            return Err("lock.initial_backoff_ms must be > 0".into());
        }
        if self.lock.max_backoff_ms < self.lock.initial_backoff_ms {
            return Err("lock.max_backoff_ms must be >= lock.initial_backoff_ms".into());
        }
        if self.lock.key_suffix.is_empty() {
            return Err("lock.key_suffix must not be empty".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

/// Redis configuration for the shared remote store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Use Redis as the remote store. When disabled an in-process store is
    /// used and the instance coordinates only with itself.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Run on the in-process store when Redis is enabled but unreachable at
    /// startup. Off by default: locks and quotas would only hold per process.
    #[serde(default)]
    pub fallback_to_memory: bool,
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            fallback_to_memory: false,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Global prefix of every cache key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry applied to entries whose policy TTL is 0
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Expiry of null-sentinel entries. 0 uses the policy TTL.
    #[serde(default)]
    pub null_ttl_secs: u64,

    /// Local (L1) cache max entries
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: u64,

    /// Local (L1) entry lifetime, also used when promoting remote hits
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,

    /// Tier used by policies that don't name one
    #[serde(default)]
    pub default_tier: TierKind,

    /// Payload wire format
    #[serde(default)]
    pub codec: Codec,

    /// Treat remote store failures as misses and recompute instead of failing
    #[serde(default)]
    pub degrade_on_store_error: bool,
}

fn default_key_prefix() -> String {
    "cacheguard".to_string()
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_local_max_entries() -> u64 {
    10000
}

fn default_local_ttl_secs() -> u64 {
    300
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }

    pub fn null_ttl(&self) -> Option<Duration> {
        (self.null_ttl_secs > 0).then(|| Duration::from_secs(self.null_ttl_secs))
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl_secs(),
            null_ttl_secs: 0,
            local_max_entries: default_local_max_entries(),
            local_ttl_secs: default_local_ttl_secs(),
            default_tier: TierKind::default(),
            codec: Codec::default(),
            degrade_on_store_error: false,
        }
    }
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lock lifetime in milliseconds; a crashed holder's lock frees after this
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    /// Retries after the first attempt: negative retries forever, 0 tries once
    #[serde(default = "default_lock_retry_count")]
    pub retry_count: i32,

    /// First Fibonacci backoff term in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap on a single backoff sleep in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Appended to a cache key to form its lock key
    #[serde(default = "default_lock_key_suffix")]
    pub key_suffix: String,
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_retry_count() -> i32 {
    30
}

fn default_initial_backoff_ms() -> u64 {
    1
}

fn default_max_backoff_ms() -> u64 {
    1000
}

fn default_lock_key_suffix() -> String {
    ":lock".to_string()
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(self.retry_count)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            retry_count: default_lock_retry_count(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            key_suffix: default_lock_key_suffix(),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Prefix of every rate-limit counter key
    #[serde(default = "default_rate_limit_prefix")]
    pub key_prefix: String,
}

fn default_rate_limit_prefix() -> String {
    "rate_limit".to_string()
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_rate_limit_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheGuardConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "cacheguard.toml";

    pub fn load_config(path: Option<&str>) -> Result<CacheGuardConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", pathbuf.display()));
        }
        // Environment variable overrides, e.g., CACHEGUARD__LOCK__RETRY_COUNT=5
        builder = builder.add_source(
            Environment::with_prefix("CACHEGUARD")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheGuardConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
