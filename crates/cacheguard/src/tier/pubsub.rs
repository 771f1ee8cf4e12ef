//! Pub/Sub for cross-instance local cache invalidation.

use std::time::Duration;

use cacheguard_core::DynStore;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::LocalTier;

/// Message published on the invalidation channel.
///
/// Wire form: `{"op":"evict","key":"app:user:42"}` or
/// `{"op":"clear","namespace":"app:user"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum InvalidationMessage {
    Evict { key: String },
    Clear { namespace: String },
}

/// Drops local entries when another instance invalidates them.
///
/// ## Example Flow
///
/// ```text
/// Instance 1: evict("app:user:42")
///   ↓
/// PUBLISH app:invalidate {"op":"evict","key":"app:user:42"}
///   ↓
/// Instance 2: listener removes "app:user:42" from its local tier
/// Instance 3: listener removes "app:user:42" from its local tier
/// ```
///
/// Instances also receive their own messages; removing an already removed
/// key is a no-op.
pub struct InvalidationListener {
    pub store: DynStore,
    pub channel: String,
    pub local: LocalTier,
}

impl InvalidationListener {
    /// Spawn the listener. Reconnects with exponential backoff whenever the
    /// subscription fails or ends.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            const MAX_BACKOFF: Duration = Duration::from_secs(300);

            loop {
                match self.run().await {
                    Ok(()) => {
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            channel = %self.channel,
                            backoff_secs = backoff.as_secs(),
                            "cache invalidation listener error, reconnecting"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        })
    }

    async fn run(&self) -> Result<(), String> {
        let mut messages = self
            .store
            .subscribe(&self.channel)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = %self.channel, "subscribed to invalidation channel");

        while let Some(payload) = messages.next().await {
            self.apply(&payload).await;
        }
        Err("subscription closed".to_string())
    }

    async fn apply(&self, payload: &str) {
        match serde_json::from_str::<InvalidationMessage>(payload) {
            Ok(InvalidationMessage::Evict { key }) => {
                tracing::debug!(key = %key, "received cache invalidation");
                self.local.remove(&key).await;
            }
            Ok(InvalidationMessage::Clear { namespace }) => {
                tracing::debug!(namespace = %namespace, "received namespace invalidation");
                if let Err(e) = self.local.remove_namespace(&namespace) {
                    tracing::warn!(namespace = %namespace, error = %e, "local clear failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse invalidation message payload");
            }
        }
    }
}

/// Publish an invalidation to every instance. Failures are logged; the
/// remote tier is already consistent and other instances' local entries
/// expire at their TTL.
pub async fn publish_invalidation(store: &DynStore, channel: &str, message: &InvalidationMessage) {
    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode invalidation message");
            return;
        }
    };
    match store.publish(channel, &payload).await {
        Ok(()) => tracing::debug!(channel = %channel, message = %payload, "published cache invalidation"),
        Err(e) => tracing::warn!(channel = %channel, error = %e, "failed to publish invalidation"),
    }
}
