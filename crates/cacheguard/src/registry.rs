//! Tier strategies by kind, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use cacheguard_core::{DynStore, KeyGenerator};

use crate::config::CacheGuardConfig;
use crate::error::{CacheError, CacheResult};
use crate::tier::{CacheStats, LocalTier, RemoteTier, TierKind, TierStrategy, TwoTier};

pub type DynTier = Arc<dyn TierStrategy>;

/// Lookup table from [`TierKind`] to strategy instance.
///
/// Strategies are registered once and shared by every policy; the map is
/// never mutated after construction.
pub struct StrategyRegistry {
    strategies: HashMap<TierKind, DynTier>,
    default_kind: TierKind,
    two_tier: Option<TwoTier>,
}

impl StrategyRegistry {
    pub fn builder(default_kind: TierKind) -> StrategyRegistryBuilder {
        StrategyRegistryBuilder {
            strategies: HashMap::new(),
            default_kind,
            two_tier: None,
        }
    }

    /// All three strategies over one store. The local and two-tier
    /// strategies share a single in-process cache, and namespace clears
    /// leave `lock.key_suffix` records to their holders.
    pub fn from_config(store: DynStore, config: &CacheGuardConfig) -> Self {
        let settings = &config.cache;
        let keys = KeyGenerator::new(settings.key_prefix.clone());
        let local = LocalTier::new(settings.local_max_entries, settings.local_ttl());
        let remote = RemoteTier::new(store).with_lock_suffix(config.lock.key_suffix.clone());
        let two_tier = TwoTier::new(local.clone(), remote.clone(), keys.invalidation_channel());

        Self::builder(settings.default_tier)
            .register(Arc::new(local))
            .register(Arc::new(remote))
            .two_tier(two_tier)
            .build()
    }

    /// Strategy for `kind`, or [`CacheError::UnknownTier`] when none is registered.
    pub fn get(&self, kind: TierKind) -> CacheResult<&DynTier> {
        self.strategies
            .get(&kind)
            .ok_or_else(|| CacheError::UnknownTier(kind.to_string()))
    }

    /// Strategy for a policy's tier, falling back to the default kind.
    pub fn resolve(&self, kind: Option<TierKind>) -> CacheResult<&DynTier> {
        self.get(kind.unwrap_or(self.default_kind))
    }

    pub fn default_kind(&self) -> TierKind {
        self.default_kind
    }

    /// The registered two-tier strategy, for starting its invalidation listener.
    pub fn two_tier(&self) -> Option<&TwoTier> {
        self.two_tier.as_ref()
    }

    pub fn stats(&self) -> Vec<(TierKind, CacheStats)> {
        let mut stats: Vec<_> = self
            .strategies
            .iter()
            .map(|(kind, strategy)| (*kind, strategy.stats()))
            .collect();
        stats.sort_by_key(|(kind, _)| kind.as_str());
        stats
    }
}

pub struct StrategyRegistryBuilder {
    strategies: HashMap<TierKind, DynTier>,
    default_kind: TierKind,
    two_tier: Option<TwoTier>,
}

impl StrategyRegistryBuilder {
    /// Register a strategy under its own kind, replacing any earlier one.
    pub fn register(mut self, strategy: DynTier) -> Self {
        self.strategies.insert(strategy.kind(), strategy);
        self
    }

    pub fn two_tier(mut self, two_tier: TwoTier) -> Self {
        self.strategies
            .insert(TierKind::TwoTier, Arc::new(two_tier.clone()));
        self.two_tier = Some(two_tier);
        self
    }

    pub fn build(self) -> StrategyRegistry {
        StrategyRegistry {
            strategies: self.strategies,
            default_kind: self.default_kind,
            two_tier: self.two_tier,
        }
    }
}
