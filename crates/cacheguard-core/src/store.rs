//! Contract of the shared key-value store every process coordinates through.
//!
//! All mutation that more than one process can race on goes through an
//! atomic primitive of the store: conditional set, compare-and-delete, and
//! the increment-within-quota script. Implementations must never emulate
//! those with a separate read and write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StoreResult;

/// Shared handle to a remote store.
pub type DynStore = Arc<dyn RemoteStore>;

/// Remote key-value store reachable by every process.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend name for logs and stats (`"redis"`, `"memory"`).
    fn name(&self) -> &'static str;

    /// GET. Returns `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// SET, with an optional expiry. `None` stores without expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// SET NX PX: store only if absent. Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// DEL. Returns the number of keys removed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// PEXPIRE. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// All keys matching a glob pattern (`*`, `?`), as SCAN MATCH does.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Delete `key` only while it still holds `expected`, atomically.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Increment the counter at `key` unless that would exceed `quota`.
    ///
    /// Returns the post-increment count, or `0` when the request is denied.
    /// The counter expires `window` after the last accepted increment.
    async fn increment_within_quota(&self, key: &str, quota: u64, window: Duration)
    -> StoreResult<u64>;

    /// Publish a message on a channel. Returns once the store accepted it.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    /// Subscribe to a channel. The stream ends when the subscription is lost.
    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>>;

    /// Cheap connectivity check.
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Longest expiry handed to a store; longer TTLs are clamped to it.
/// Redis rejects a PX whose deadline overflows its clock.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Rate-limit window in whole seconds for EXPIRE, rounded up and at least 1.
pub fn window_secs(window: Duration) -> u64 {
    window
        .as_secs()
        .saturating_add(u64::from(window.subsec_nanos() > 0))
        .max(1)
}

/// Redis-style glob match supporting `*`, `?` and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() && p[pi + 1] == t[ti] => {
                    pi += 2;
                    ti += 1;
                    continue;
                }
                c if c != '\\' && c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
