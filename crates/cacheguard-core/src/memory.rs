//! In-process implementation of the remote store contract.
//!
//! Used when no Redis is configured (single-instance mode) and as the shared
//! store between simulated processes in tests. Every operation runs under
//! one mutex, which makes each primitive atomic the same way a Redis script is.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{StoreError, StoreResult};
use crate::store::{MAX_TTL, RemoteStore, glob_match, window_secs};

const CHANNEL_CAPACITY: usize = 1024;

struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Expiry instant for `ttl` from `now`; `None` if the clock can't represent it.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl.min(MAX_TTL))
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-memory key-value store with TTL and pub/sub.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Slot>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .lock()
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let data = self.data.lock();
        let slot = data.get(key).filter(|slot| !slot.is_expired(now))?;
        slot.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn live_value(data: &mut HashMap<String, Slot>, key: &str, now: Instant) -> Option<Vec<u8>> {
        let expired = data.get(key)?.is_expired(now);
        if expired {
            data.remove(key);
            return None;
        }
        data.get(key).map(|slot| slot.value.clone())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut data = self.data.lock();
        Ok(Self::live_value(&mut data, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        self.data.lock().insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at: ttl.and_then(|ttl| deadline(now, ttl)),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if Self::live_value(&mut data, key, now).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let mut removed = 0;
        for key in keys {
            if let Some(slot) = data.remove(key) {
                if !slot.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if Self::live_value(&mut data, key, now).is_none() {
            return Ok(false);
        }
        if let Some(slot) = data.get_mut(key) {
            slot.expires_at = deadline(now, ttl);
        }
        Ok(true)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let data = self.data.lock();
        Ok(data
            .iter()
            .filter(|(key, slot)| !slot.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut data = self.data.lock();
        match Self::live_value(&mut data, key, now) {
            Some(value) if value == expected.as_bytes() => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_within_quota(
        &self,
        key: &str,
        quota: u64,
        window: Duration,
    ) -> StoreResult<u64> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let current = match Self::live_value(&mut data, key, now) {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| StoreError::script(format!("counter at {key} is not an integer")))?,
            None => 0,
        };

        if current + 1 > quota {
            return Ok(0);
        }

        let next = current + 1;
        data.insert(
            key.to_string(),
            Slot {
                value: next.to_string().into_bytes(),
                expires_at: deadline(now, Duration::from_secs(window_secs(window))),
            },
        );
        Ok(next)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        if let Some(tx) = self.channels.lock().get(channel) {
            // No receivers is not an error, same as PUBLISH returning 0.
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>> {
        let rx = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory store subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
