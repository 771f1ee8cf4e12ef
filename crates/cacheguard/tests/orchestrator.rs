//! Integration tests for cache-aside orchestration.
//!
//! Every test runs against the in-process store. "Processes" are simulated by
//! separate `CacheGuard` instances sharing one store: each has its own local
//! tier and in-flight gates, and they coordinate only through the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cacheguard::{
    CacheError, CacheGuard, CacheGuardConfig, CachePolicy, InvalidateMany, InvalidateOne,
    InvocationContext, KeyExpr, MemoryStore, ReadThrough, RemoteStore, RetryBudget, StoreError,
    TierKind, WriteThrough,
};
use cacheguard_core::{DynStore, NULL_SENTINEL, StoreResult};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("user source unavailable")]
    Source,
}

fn config() -> CacheGuardConfig {
    let mut cfg = CacheGuardConfig::default();
    cfg.redis.enabled = false;
    cfg.cache.key_prefix = "app".into();
    cfg
}

fn instance(store: &Arc<MemoryStore>) -> CacheGuard {
    let shared: DynStore = store.clone();
    CacheGuard::with_store(shared, &config())
}

fn user_policy() -> ReadThrough {
    ReadThrough::new("user").key(KeyExpr::Arg(0))
}

fn get_user(id: u64) -> InvocationContext {
    InvocationContext::new("getUser").arg(id)
}

#[tokio::test]
async fn test_read_through_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let user = guard
            .orchestrator
            .cached::<User, AppError, _, _>(&user_policy(), &get_user(42), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(User {
                    id: 42,
                    name: "Ann".into(),
                }))
            })
            .await
            .unwrap();
        assert_eq!(user.unwrap().name, "Ann");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = store.get("app:user:42").await.unwrap().unwrap();
    let decoded: User = serde_json::from_slice(&stored).unwrap();
    assert_eq!(decoded.id, 42);
    // The lock is gone once the computation is done.
    assert!(store.get("app:user:42:lock").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_data_is_cached_as_sentinel() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    let calls = AtomicUsize::new(0);

    for _ in 0..5 {
        let user = guard
            .orchestrator
            .cached::<User, AppError, _, _>(&user_policy(), &get_user(404), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert!(user.is_none());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.get("app:user:404").await.unwrap().as_deref(),
        Some(NULL_SENTINEL)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_compute_once() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    let orchestrator = guard.orchestrator.clone();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let orchestrator = orchestrator.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .cached::<User, AppError, _, _>(&user_policy(), &get_user(7), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Some(User {
                        id: 7,
                        name: "Gus".into(),
                    }))
                })
                .await
        }));
    }

    for handle in handles {
        let user = handle.await.unwrap().unwrap();
        assert_eq!(user.unwrap().id, 7);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processes_sharing_a_store_compute_once() {
    let store = Arc::new(MemoryStore::new());
    let instances: Vec<CacheGuard> = (0..4).map(|_| instance(&store)).collect();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for guard in &instances {
        for _ in 0..10 {
            let orchestrator = guard.orchestrator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                orchestrator
                    .cached::<User, AppError, _, _>(&user_policy(), &get_user(8), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Some(User {
                            id: 8,
                            name: "Hal".into(),
                        }))
                    })
                    .await
            }));
        }
    }

    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_some());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lock_exhaustion_returns_current_content() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config();
    cfg.lock.retry_count = 0;
    let guard = CacheGuard::with_store(store.clone(), &cfg);

    // Another process holds the lock and hasn't stored anything yet.
    store
        .set_if_absent("app:user:5:lock", b"other", Duration::from_secs(30))
        .await
        .unwrap();

    let calls = AtomicUsize::new(0);
    let user = guard
        .orchestrator
        .cached::<User, AppError, _, _>(&user_policy(), &get_user(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(User {
                id: 5,
                name: "Eve".into(),
            }))
        })
        .await
        .unwrap();

    assert!(user.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // Someone else's lock is left alone.
    assert_eq!(
        store.get("app:user:5:lock").await.unwrap().as_deref(),
        Some(&b"other"[..])
    );
}

#[tokio::test]
async fn test_write_through_overwrites() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    let orch = &guard.orchestrator;
    let put = WriteThrough::new("user").key(KeyExpr::Arg(0));
    let calls = AtomicUsize::new(0);

    for name in ["Ann", "Ann", "Anna"] {
        let written = orch
            .cache_put::<User, AppError, _, _>(&put, &get_user(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(User {
                    id: 1,
                    name: name.into(),
                }))
            })
            .await
            .unwrap();
        assert_eq!(written.unwrap().name, name);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let cached = orch
        .cached::<User, AppError, _, _>(&user_policy(), &get_user(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await
        .unwrap();
    assert_eq!(cached.unwrap().name, "Anna");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_invalidate_one_forces_recompute() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    let orch = &guard.orchestrator;
    let calls = AtomicUsize::new(0);
    let load = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, AppError>(Some(User {
            id: 2,
            name: "Bob".into(),
        }))
    };

    orch.cached(&user_policy(), &get_user(2), load).await.unwrap();
    orch.cache_del::<(), AppError, _, _>(
        &InvalidateOne::new("user").key(KeyExpr::Arg(0)),
        &get_user(2),
        || async { Ok(Some(())) },
    )
    .await
    .unwrap();
    assert!(store.get("app:user:2").await.unwrap().is_none());

    orch.cached(&user_policy(), &get_user(2), load).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_many_keys_and_namespace() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    let orch = &guard.orchestrator;

    for id in 1..=4u64 {
        orch.cached::<User, AppError, _, _>(&user_policy(), &get_user(id), || async move {
            Ok(Some(User {
                id,
                name: format!("user{id}"),
            }))
        })
        .await
        .unwrap();
    }
    orch.cached::<u32, AppError, _, _>(
        &ReadThrough::new("order").key("latest"),
        &InvocationContext::new("latestOrder"),
        || async { Ok(Some(99)) },
    )
    .await
    .unwrap();

    let some = InvalidateMany::keys("user", vec![KeyExpr::fixed("1"), KeyExpr::fixed("2")]);
    orch.cache_dels::<(), AppError, _, _>(&some, &InvocationContext::new("purge"), || async {
        Ok(None)
    })
    .await
    .unwrap();
    assert!(store.get("app:user:1").await.unwrap().is_none());
    assert!(store.get("app:user:2").await.unwrap().is_none());
    assert!(store.get("app:user:3").await.unwrap().is_some());

    let all = InvalidateMany::all_entries("user");
    orch.cache_dels::<(), AppError, _, _>(&all, &InvocationContext::new("purge"), || async {
        Ok(None)
    })
    .await
    .unwrap();
    assert!(store.scan("app:user:*").await.unwrap().is_empty());
    assert!(store.get("app:order:latest").await.unwrap().is_some());

    // Local copies are gone too: a read goes back to the source.
    let calls = AtomicUsize::new(0);
    orch.cached::<User, AppError, _, _>(&user_policy(), &get_user(3), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_namespace_clear_leaves_held_locks() {
    let store = Arc::new(MemoryStore::new());
    let first = instance(&store);
    let second = instance(&store);

    first
        .orchestrator
        .cached::<u32, AppError, _, _>(&user_policy(), &get_user(1), || async { Ok(Some(1)) })
        .await
        .unwrap();
    let held = first
        .lock
        .acquire("app:user:1:lock", Duration::from_secs(30), RetryBudget::SINGLE_ATTEMPT)
        .await
        .unwrap();

    let all = InvalidateMany::all_entries("user");
    first
        .orchestrator
        .cache_dels::<(), AppError, _, _>(&all, &InvocationContext::new("purge"), || async {
            Ok(None)
        })
        .await
        .unwrap();
    assert!(store.get("app:user:1").await.unwrap().is_none());

    assert!(
        second
            .lock
            .try_acquire("app:user:1:lock", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none()
    );
    assert!(held.release().await.unwrap());
}

#[tokio::test]
async fn test_undecodable_payload_is_an_error() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    store.set("app:user:13", b"{not json", None).await.unwrap();

    let calls = AtomicUsize::new(0);
    let err = guard
        .orchestrator
        .cached::<User, AppError, _, _>(&user_policy(), &get_user(13), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(matches!(
        err,
        AppError::Cache(CacheError::Serialization { ref key, .. }) if key == "app:user:13"
    ));
}

#[tokio::test]
async fn test_compute_errors_are_returned_and_not_cached() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);

    let err = guard
        .orchestrator
        .cached::<User, AppError, _, _>(&user_policy(), &get_user(21), || async {
            Err(AppError::Source)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Source));
    assert!(store.get("app:user:21").await.unwrap().is_none());
    assert!(store.get("app:user:21:lock").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_hits_promoted_to_local() {
    let store = Arc::new(MemoryStore::new());
    let writer = instance(&store);
    let reader = instance(&store);

    writer
        .orchestrator
        .cached::<User, AppError, _, _>(&user_policy(), &get_user(30), || async {
            Ok(Some(User {
                id: 30,
                name: "Ida".into(),
            }))
        })
        .await
        .unwrap();

    let local = reader
        .orchestrator
        .registry()
        .two_tier()
        .unwrap()
        .local()
        .clone();
    assert!(local.peek("app:user:30").await.is_none());

    let calls = AtomicUsize::new(0);
    let user = reader
        .orchestrator
        .cached::<User, AppError, _, _>(&user_policy(), &get_user(30), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await
        .unwrap();
    assert_eq!(user.unwrap().name, "Ida");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(local.peek("app:user:30").await.is_some());
}

#[tokio::test]
async fn test_invoke_dispatches_policies() {
    let store = Arc::new(MemoryStore::new());
    let guard = instance(&store);
    let orch = &guard.orchestrator;
    let ctx = get_user(50);

    let policies: Vec<CachePolicy> = vec![
        WriteThrough::new("user").key(KeyExpr::Arg(0)).into(),
        ReadThrough::new("user").key(KeyExpr::Arg(0)).into(),
        InvalidateOne::new("user").key(KeyExpr::Arg(0)).into(),
    ];
    let calls = AtomicUsize::new(0);
    for policy in &policies {
        orch.invoke::<u64, AppError, _, _>(policy, &ctx, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(50))
        })
        .await
        .unwrap();
    }

    // The read-through call was served from the write-through entry.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(store.get("app:user:50").await.unwrap().is_none());
}

/// A store whose every operation fails, as if Redis were down.
struct DownStore;

#[async_trait]
impl RemoteStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(StoreError::connection("connection refused"))
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> StoreResult<()> {
        Err(StoreError::connection("connection refused"))
    }

    async fn set_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> StoreResult<bool> {
        Err(StoreError::connection("connection refused"))
    }

    async fn delete(&self, _keys: &[String]) -> StoreResult<u64> {
        Err(StoreError::connection("connection refused"))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(StoreError::connection("connection refused"))
    }

    async fn scan(&self, _pattern: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::connection("connection refused"))
    }

    async fn compare_and_delete(&self, _key: &str, _expected: &str) -> StoreResult<bool> {
        Err(StoreError::connection("connection refused"))
    }

    async fn increment_within_quota(
        &self,
        _key: &str,
        _quota: u64,
        _window: Duration,
    ) -> StoreResult<u64> {
        Err(StoreError::connection("connection refused"))
    }

    async fn publish(&self, _channel: &str, _message: &str) -> StoreResult<()> {
        Err(StoreError::connection("connection refused"))
    }

    async fn subscribe(&self, _channel: &str) -> StoreResult<BoxStream<'static, String>> {
        Err(StoreError::connection("connection refused"))
    }
}

#[tokio::test]
async fn test_store_failure_propagates_by_default() {
    let guard = CacheGuard::with_store(Arc::new(DownStore), &config());
    let policy = user_policy().tier(TierKind::Remote);

    let err = guard
        .orchestrator
        .cached::<User, AppError, _, _>(&policy, &get_user(1), || async { Ok(None) })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Cache(CacheError::StoreUnavailable(_))));
}

#[tokio::test]
async fn test_store_failure_degrades_to_recompute() {
    let mut cfg = config();
    cfg.cache.degrade_on_store_error = true;
    let guard = CacheGuard::with_store(Arc::new(DownStore), &cfg);
    let policy = user_policy().tier(TierKind::Remote);
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
        let user = guard
            .orchestrator
            .cached::<User, AppError, _, _>(&policy, &get_user(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(User {
                    id: 1,
                    name: "Ann".into(),
                }))
            })
            .await
            .unwrap();
        assert_eq!(user.unwrap().id, 1);
    }
    // Nothing could be cached, so every call computes.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
