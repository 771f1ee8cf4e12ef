//! Fixed-window rate limiting.
//!
//! Each check is one atomic store operation (a Lua script on Redis) that
//! increments the window counter only when the quota allows it. A separate
//! read followed by an increment would let concurrent requests overshoot.
//!
//! ## Key Format
//!
//! `{prefix}:{request_path}:{client}:{resolved_key}`, e.g.
//! `rate_limit:/api/login:10.0.0.7:ann`

use std::time::Duration;

use cacheguard_core::{DynStore, InvocationContext, KeyExpr, window_secs};

use crate::config::RateLimitSettings;
use crate::error::{CacheError, CacheResult};
use crate::metrics;

/// Client identifier used by rules that count every caller together.
pub const GLOBAL_CLIENT: &str = "global";

/// Whose requests share one counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LimitScope {
    /// One counter for all clients.
    #[default]
    Global,
    /// One counter per client identifier.
    PerClient,
}

/// A quota applied to a family of requests.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub key: KeyExpr,
    pub quota: u64,
    pub window: Duration,
    pub scope: LimitScope,
}

impl RateLimitRule {
    pub fn new(quota: u64, window: Duration) -> Self {
        Self {
            key: KeyExpr::fixed(""),
            quota,
            window,
            scope: LimitScope::Global,
        }
    }

    pub fn key(mut self, key: impl Into<KeyExpr>) -> Self {
        self.key = key.into();
        self
    }

    pub fn per_client(mut self) -> Self {
        self.scope = LimitScope::PerClient;
        self
    }
}

/// The request being counted.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRequest<'a> {
    pub path: &'a str,
    pub client: &'a str,
    pub ctx: &'a InvocationContext,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub key: String,
    pub allowed: bool,
    /// Requests counted in the current window, this one included when allowed.
    pub count: u64,
    pub quota: u64,
    pub window: Duration,
}

impl RateLimitDecision {
    pub fn remaining(&self) -> u64 {
        self.quota.saturating_sub(self.count)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: DynStore,
    prefix: String,
}

impl RateLimiter {
    pub fn new(store: DynStore, settings: &RateLimitSettings) -> Self {
        Self {
            store,
            prefix: settings.key_prefix.clone(),
        }
    }

    /// Counter key for a request.
    pub fn key(&self, path: &str, client: &str, resolved: &str) -> String {
        format!("{}:{path}:{client}:{resolved}", self.prefix)
    }

    /// Count one request against `key`. `false` when the quota is used up.
    pub async fn allow(&self, key: &str, quota: u64, window: Duration) -> CacheResult<bool> {
        Ok(self.count(key, quota, window).await? > 0)
    }

    async fn count(&self, key: &str, quota: u64, window: Duration) -> CacheResult<u64> {
        let count = self
            .store
            .increment_within_quota(key, quota, window)
            .await?;
        let allowed = count > 0;
        metrics::record_rate_limit(allowed);
        if !allowed {
            tracing::debug!(
                key = %key,
                quota,
                window_secs = window_secs(window),
                "rate limit exceeded"
            );
        }
        Ok(count)
    }

    /// Count a request under `rule`.
    pub async fn check(
        &self,
        rule: &RateLimitRule,
        request: RateLimitRequest<'_>,
    ) -> CacheResult<RateLimitDecision> {
        let client = match rule.scope {
            LimitScope::Global => GLOBAL_CLIENT,
            LimitScope::PerClient => request.client,
        };
        let key = self.key(request.path, client, &rule.key.resolve(request.ctx));
        let count = self.count(&key, rule.quota, rule.window).await?;
        Ok(RateLimitDecision {
            key,
            allowed: count > 0,
            count: if count > 0 { count } else { rule.quota },
            quota: rule.quota,
            window: rule.window,
        })
    }

    /// Like [`RateLimiter::check`], but a denial is returned as [`CacheError::RateLimited`].
    pub async fn enforce(
        &self,
        rule: &RateLimitRule,
        request: RateLimitRequest<'_>,
    ) -> CacheResult<RateLimitDecision> {
        let decision = self.check(rule, request).await?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(CacheError::RateLimited {
                key: decision.key,
                quota: decision.quota,
                window_secs: window_secs(decision.window),
            })
        }
    }
}
