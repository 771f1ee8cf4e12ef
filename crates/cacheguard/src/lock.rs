//! Distributed mutual exclusion over the remote store.
//!
//! ## Protocol
//!
//! ```text
//! acquire: SET {key} {token} NX PX {ttl}   → retry after Fibonacci backoff
//! release: EVAL compare-and-delete {key} {token}
//! ```
//!
//! The token is a fresh UUID per acquisition, so a holder whose lock expired
//! and was taken over can never delete the new holder's lock. There is no
//! renewal: a crashed holder's lock frees itself after its TTL.

use std::future::Future;
use std::time::Duration;

use cacheguard_core::{CacheKey, DynStore, FibonacciBackoff, RetryBudget};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::config::LockSettings;
use crate::error::{CacheError, CacheResult};
use crate::metrics;

/// A lock as stored remotely: `key` holds `holder_token` for at most `ttl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub holder_token: String,
    pub ttl: Duration,
}

/// Acquires and releases named locks.
#[derive(Clone)]
pub struct DistributedLock {
    store: DynStore,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(store: DynStore, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Lock key guarding a cache entry.
    pub fn lock_key(&self, cache_key: &CacheKey) -> String {
        format!("{}{}", cache_key.as_str(), self.settings.key_suffix)
    }

    /// One conditional set. `None` when someone else holds the lock.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> CacheResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        self.attempt(key, &token, ttl).await
    }

    async fn attempt(&self, key: &str, token: &str, ttl: Duration) -> CacheResult<Option<LockGuard>> {
        if self.store.set_if_absent(key, token.as_bytes(), ttl).await? {
            tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
            metrics::record_lock("acquired");
            Ok(Some(LockGuard {
                store: self.store.clone(),
                record: LockRecord {
                    key: key.to_string(),
                    holder_token: token.to_string(),
                    ttl,
                },
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Acquire, retrying with Fibonacci-spaced sleeps until `budget` runs out.
    ///
    /// Returns [`CacheError::LockBusy`] when every attempt found the lock held.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        budget: RetryBudget,
    ) -> CacheResult<LockGuard> {
        let token = Uuid::new_v4().to_string();
        let mut backoff = FibonacciBackoff::new(self.settings.initial_backoff())
            .with_max(self.settings.max_backoff());
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            if let Some(guard) = self.attempt(key, &token, ttl).await? {
                return Ok(guard);
            }
            if !budget.allows_another(attempts) {
                tracing::debug!(key = %key, attempts, "lock busy, retries exhausted");
                metrics::record_lock("busy");
                return Err(CacheError::lock_busy(key, attempts));
            }
            let delay = backoff.next_delay();
            tracing::trace!(key = %key, attempts, delay_ms = delay.as_millis() as u64, "lock held, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    /// Release `key` if it is still held by `holder_token`.
    ///
    /// Returns `false` when the lock expired or now belongs to someone else.
    pub async fn release(&self, key: &str, holder_token: &str) -> CacheResult<bool> {
        release_record(&self.store, key, holder_token).await
    }

    /// Run an action while holding `key`, with the configured TTL and retry budget.
    pub fn with_lock<'a, T, E>(&'a self, key: impl Into<String>) -> LockTask<'a, T, E> {
        LockTask {
            lock: self,
            key: key.into(),
            ttl: self.settings.ttl(),
            budget: self.settings.retry_budget(),
            degrade_on_store_error: false,
            on_success: None,
            on_lock_fail: None,
            on_error: None,
        }
    }
}

async fn release_record(store: &DynStore, key: &str, holder_token: &str) -> CacheResult<bool> {
    let released = store.compare_and_delete(key, holder_token).await?;
    if released {
        tracing::debug!(key = %key, "lock released");
        metrics::record_lock("released");
    } else {
        tracing::warn!(key = %key, "lock no longer held by this token, release skipped");
        metrics::record_lock("stale");
    }
    Ok(released)
}

/// Proof of holding a lock.
///
/// Call [`LockGuard::release`] when done. A guard dropped without release
/// (panic, cancelled future) schedules the release on the current runtime;
/// outside a runtime the lock is left to expire.
pub struct LockGuard {
    store: DynStore,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub fn token(&self) -> &str {
        &self.record.holder_token
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub async fn release(mut self) -> CacheResult<bool> {
        self.released = true;
        release_record(&self.store, &self.record.key, &self.record.holder_token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let record = self.record.clone();
                handle.spawn(async move {
                    if let Err(e) = release_record(&store, &record.key, &record.holder_token).await {
                        tracing::warn!(key = %record.key, error = %e, "background lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = %self.record.key,
                    ttl_ms = self.record.ttl.as_millis() as u64,
                    "lock guard dropped outside a runtime, lock will expire at ttl"
                );
            }
        }
    }
}

type SuccessHook<'a, T> = Box<dyn FnOnce(T) -> T + Send + 'a>;
type LockFailHook<'a, T, E> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, E>> + Send + 'a>;
type ErrorHook<'a, T, E> = Box<dyn FnOnce(E) -> Result<T, E> + Send + 'a>;

/// Builder running an action under a lock.
///
/// ```ignore
/// let user = lock
///     .with_lock("app:user:42:lock")
///     .retry_count(5)
///     .on_lock_fail(|| async { Ok(None) })
///     .run(|| async { load_user(42).await })
///     .await?;
/// ```
///
/// The lock is released before the result (or error) is returned, on every
/// path. Hooks:
/// - `on_success` maps the action's result
/// - `on_lock_fail` supplies the result when the retry budget is exhausted;
///   without it, exhaustion is reported as [`CacheError::LockBusy`]
/// - `on_error` sees the action's error; without it the error is returned as-is
pub struct LockTask<'a, T, E> {
    lock: &'a DistributedLock,
    key: String,
    ttl: Duration,
    budget: RetryBudget,
    degrade_on_store_error: bool,
    on_success: Option<SuccessHook<'a, T>>,
    on_lock_fail: Option<LockFailHook<'a, T, E>>,
    on_error: Option<ErrorHook<'a, T, E>>,
}

impl<'a, T, E> LockTask<'a, T, E>
where
    T: Send + 'a,
    E: From<CacheError> + Send + 'a,
{
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn retry_count(mut self, retry_count: i32) -> Self {
        self.budget = RetryBudget::new(retry_count);
        self
    }

    /// Run the action unlocked when the store itself fails during acquisition.
    pub fn degrade_on_store_error(mut self, degrade: bool) -> Self {
        self.degrade_on_store_error = degrade;
        self
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(T) -> T + Send + 'a,
    {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_lock_fail<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.on_lock_fail = Some(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(E) -> Result<T, E> + Send + 'a,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub async fn run<F, Fut>(self, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let LockTask {
            lock,
            key,
            ttl,
            budget,
            degrade_on_store_error,
            on_success,
            on_lock_fail,
            on_error,
        } = self;

        let guard = match lock.acquire(&key, ttl, budget).await {
            Ok(guard) => Some(guard),
            Err(CacheError::LockBusy { attempts, .. }) if on_lock_fail.is_some() => {
                tracing::debug!(key = %key, attempts, "lock not acquired, running fallback");
                return match on_lock_fail {
                    Some(fallback) => fallback().await,
                    None => Err(CacheError::lock_busy(key, attempts).into()),
                };
            }
            Err(CacheError::StoreUnavailable(e)) if degrade_on_store_error => {
                tracing::warn!(key = %key, error = %e, "lock store unavailable, running without lock");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = action().await;

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                tracing::warn!(key = %key, error = %e, "lock release failed, lock will expire at ttl");
            }
        }

        match outcome {
            Ok(value) => Ok(match on_success {
                Some(hook) => hook(value),
                None => value,
            }),
            Err(e) => match on_error {
                Some(hook) => hook(e),
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cacheguard_core::{MemoryStore, RemoteStore};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_lock() -> (Arc<MemoryStore>, DistributedLock) {
        let store = Arc::new(MemoryStore::new());
        let settings = LockSettings {
            ttl_ms: 5_000,
            retry_count: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            ..LockSettings::default()
        };
        (store.clone(), DistributedLock::new(store, settings))
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Cache(#[from] CacheError),
        #[error("boom")]
        Boom,
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (store, lock) = test_lock();
        let guard = lock
            .acquire("res", Duration::from_secs(5), RetryBudget::SINGLE_ATTEMPT)
            .await
            .unwrap();

        let stored = store.get("res").await.unwrap().unwrap();
        assert_eq!(stored, guard.token().as_bytes());

        assert!(guard.release().await.unwrap());
        assert!(store.get("res").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_attempt_fails_when_held() {
        let (_store, lock) = test_lock();
        let _held = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();

        let err = lock
            .acquire("res", Duration::from_secs(5), RetryBudget::SINGLE_ATTEMPT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::LockBusy { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_retry_count_bounds_attempts() {
        let (_store, lock) = test_lock();
        let _held = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();

        let err = lock
            .acquire("res", Duration::from_secs(5), RetryBudget::new(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::LockBusy { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_holder_releases() {
        let (_store, lock) = test_lock();
        let held = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            held.release().await.unwrap()
        });

        let guard = lock
            .acquire("res", Duration::from_secs(5), RetryBudget::UNBOUNDED)
            .await
            .unwrap();
        assert!(releaser.await.unwrap());
        assert!(guard.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_noop() {
        let (store, lock) = test_lock();
        let guard = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();

        assert!(!lock.release("res", "someone-else").await.unwrap());
        assert!(store.get("res").await.unwrap().is_some());
        assert!(guard.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_release_does_not_delete_new_holder() {
        let (store, lock) = test_lock();
        let first = lock
            .try_acquire("res", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();

        assert!(!first.release().await.unwrap());
        let stored = store.get("res").await.unwrap().unwrap();
        assert_eq!(stored, second.token().as_bytes());
        assert!(second.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let (store, lock) = test_lock();
        {
            let _guard = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();
        }
        for _ in 0..50 {
            if store.get("res").await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("dropped guard did not release the lock");
    }

    #[tokio::test]
    async fn test_with_lock_runs_action_and_releases() {
        let (store, lock) = test_lock();
        let result: Result<u32, CacheError> = lock
            .with_lock("res")
            .on_success(|v| v * 2)
            .run(|| async { Ok(21) })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_with_lock_fallback_when_busy() {
        let (_store, lock) = test_lock();
        let _held = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();

        let ran = AtomicUsize::new(0);
        let result: Result<&str, CacheError> = lock
            .with_lock("res")
            .retry_count(0)
            .on_lock_fail(|| async { Ok("fallback") })
            .run(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok("computed")
            })
            .await;
        assert_eq!(result.unwrap(), "fallback");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_with_lock_busy_without_fallback() {
        let (_store, lock) = test_lock();
        let _held = lock.try_acquire("res", Duration::from_secs(5)).await.unwrap().unwrap();

        let result: Result<(), CacheError> = lock
            .with_lock("res")
            .retry_count(0)
            .run(|| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(CacheError::LockBusy { .. })));
    }

    #[tokio::test]
    async fn test_with_lock_error_propagates_after_release() {
        let (store, lock) = test_lock();
        let result: Result<(), TestError> = lock
            .with_lock("res")
            .run(|| async { Err(TestError::Boom) })
            .await;
        assert!(matches!(result, Err(TestError::Boom)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_with_lock_error_hook_intercepts() {
        let (store, lock) = test_lock();
        let result: Result<&str, TestError> = lock
            .with_lock("res")
            .on_error(|_| Ok("recovered"))
            .run(|| async { Err(TestError::Boom) })
            .await;
        assert_eq!(result.unwrap(), "recovered");
        assert!(store.is_empty());
    }

    #[test]
    fn test_lock_key_suffix() {
        let (_store, lock) = test_lock();
        let key = cacheguard_core::KeyGenerator::new("app").key("user", "42");
        assert_eq!(lock.lock_key(&key), "app:user:42:lock");
    }
}
