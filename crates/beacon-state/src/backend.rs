//! Async store traits consumed by the discovery and cache layers.
//!
//! Both are object-safe so callers can hold `Arc<dyn CoordinationStore>`
//! and swap the embedded store for a remote one.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::{KeyValue, Lease, LeaseId, WatchEvent};

/// Buffer of a per-watch event channel.
pub const WATCH_BUFFER: usize = 64;

/// Leases, lease-bound keys, prefix reads and prefix watches.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn grant(&self, ttl_secs: u64) -> StateResult<Lease>;

    /// Write `key`, bound to `lease` when given.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StateResult<()>;

    /// Renew a lease for its full TTL. Fails with `LeaseNotFound` once
    /// the lease has expired.
    async fn keep_alive(&self, lease: LeaseId) -> StateResult<Lease>;

    /// Drop a lease and its keys. Returns true if the lease was known.
    async fn revoke(&self, lease: LeaseId) -> StateResult<bool>;

    async fn get_prefix(&self, prefix: &str) -> StateResult<Vec<KeyValue>>;

    async fn delete_key(&self, key: &str) -> StateResult<bool>;

    /// Stream change events for keys under `prefix`.
    ///
    /// The channel closes when the store goes away; dropping the receiver
    /// ends the subscription.
    async fn watch(&self, prefix: &str) -> StateResult<mpsc::Receiver<WatchEvent>>;
}

/// Byte values with optional TTLs plus the two atomic primitives the
/// load guard needs.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Store `value`; `None` TTL means the entry never expires.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()>;

    /// Store `value` only if no live entry exists. Returns true if stored.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StateResult<bool>;

    async fn delete(&self, key: &str) -> StateResult<bool>;

    async fn exists(&self, key: &str) -> StateResult<bool>;

    /// Delete `key` only if its live value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StateResult<bool>;
}

#[async_trait]
impl CoordinationStore for StateStore {
    async fn grant(&self, ttl_secs: u64) -> StateResult<Lease> {
        self.grant_lease(ttl_secs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StateResult<()> {
        self.put_key(key, value, lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StateResult<Lease> {
        self.keep_alive_lease(lease)
    }

    async fn revoke(&self, lease: LeaseId) -> StateResult<bool> {
        self.revoke_lease(lease)
    }

    async fn get_prefix(&self, prefix: &str) -> StateResult<Vec<KeyValue>> {
        self.list_prefix(prefix)
    }

    async fn delete_key(&self, key: &str) -> StateResult<bool> {
        StateStore::delete_key(self, key)
    }

    async fn watch(&self, prefix: &str) -> StateResult<mpsc::Receiver<WatchEvent>> {
        let mut events = self.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) if event.key.starts_with(&prefix) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%prefix, skipped, "watch lagged behind store events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            debug!(%prefix, "watch ended");
        });

        Ok(rx)
    }
}

#[async_trait]
impl CacheStore for StateStore {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.cache_get(key)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
        self.cache_set(key, value, ttl)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StateResult<bool> {
        self.cache_set_if_absent(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        self.cache_delete(key)
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        self.cache_exists(key)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StateResult<bool> {
        self.cache_compare_and_delete(key, expected)
    }
}
