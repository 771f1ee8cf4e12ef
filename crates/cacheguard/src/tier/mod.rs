//! Cache tiers.
//!
//! ## Architecture
//!
//! - **Local (moka)**: in-process, bounded, per-entry TTL
//! - **Remote (store)**: shared across instances, source of truth
//! - **Two-tier**: local first, remote on miss, remote hits promoted to local
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get → Local → Remote → miss (caller computes)
//!         ↑        │
//!         └────────┘ promote with the local default TTL
//! ```
//!
//! Writes and invalidations go to the remote tier first, so a crash between
//! the two steps can leave the local tier missing a value but never holding
//! one the remote tier doesn't have.

pub mod local;
pub mod pubsub;
pub mod remote;
pub mod two_tier;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cacheguard_core::CacheKey;
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

pub use local::LocalTier;
pub use pubsub::{InvalidationListener, InvalidationMessage};
pub use remote::RemoteTier;
pub use two_tier::TwoTier;

/// Which tier strategy a policy uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Local,
    Remote,
    #[default]
    TwoTier,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Local => "local",
            TierKind::Remote => "remote",
            TierKind::TwoTier => "two_tier",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(TierKind::Local),
            "remote" => Ok(TierKind::Remote),
            "two_tier" | "two-tier" | "both" => Ok(TierKind::TwoTier),
            other => Err(format!("unknown cache tier: {other}")),
        }
    }
}

/// How long a stored entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expiration {
    /// `None` stores without expiry.
    pub ttl: Option<Duration>,
    /// Local tier only: every read restarts the entry's TTL.
    pub refresh_on_read: bool,
}

impl Expiration {
    pub fn after(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            refresh_on_read: false,
        }
    }

    pub fn never() -> Self {
        Self::default()
    }

    pub fn refreshed_on_read(mut self) -> Self {
        self.refresh_on_read = true;
        self
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Entries held in the local tier, if this strategy has one.
    pub local_entries: Option<u64>,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// A cache backend storing opaque payloads.
///
/// Payloads are `Arc`ed so hits are cheap to clone and a value can be
/// written to several tiers without copying.
#[async_trait]
pub trait TierStrategy: Send + Sync {
    fn kind(&self) -> TierKind;

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Arc<Vec<u8>>>>;

    async fn put(&self, key: &CacheKey, value: Arc<Vec<u8>>, expiration: Expiration)
    -> CacheResult<()>;

    async fn evict(&self, key: &CacheKey) -> CacheResult<()>;

    async fn evict_many(&self, keys: &[CacheKey]) -> CacheResult<()> {
        for key in keys {
            self.evict(key).await?;
        }
        Ok(())
    }

    /// Remove every entry of a namespace (`{prefix}:{namespace}`).
    async fn clear(&self, namespace: &str) -> CacheResult<()>;

    fn stats(&self) -> CacheStats;
}
