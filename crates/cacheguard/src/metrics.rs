//! Counters for cache, lock and rate-limit activity.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding application installs a recorder.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_COMPUTATIONS_TOTAL: &str = "cache_computations_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const LOCK_ACQUISITIONS_TOTAL: &str = "lock_acquisitions_total";
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";
}

/// Record a cache hit.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(tier: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "tier" => tier).increment(1);
}

/// Record one execution of a cached unit of work.
pub fn record_computation(namespace: &str) {
    counter!(names::CACHE_COMPUTATIONS_TOTAL, "namespace" => namespace.to_string()).increment(1);
}

/// Set the number of local cache entries.
pub fn set_cache_entries(tier: &'static str, count: u64) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier).set(count as f64);
}

/// Record a lock outcome (`acquired`, `busy`, `released`, `stale`).
pub fn record_lock(outcome: &'static str) {
    counter!(names::LOCK_ACQUISITIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a rate-limit decision.
pub fn record_rate_limit(allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "outcome" => outcome).increment(1);
}
