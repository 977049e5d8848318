//! Store double that can be switched off to simulate an outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_state::{
    CoordinationStore, KeyValue, Lease, LeaseId, StateError, StateResult, StateStore, WatchEvent,
};

pub(crate) struct FlakyStore {
    pub inner: StateStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StateStore::open_in_memory().unwrap(),
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StateResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(StateError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationStore for FlakyStore {
    async fn grant(&self, ttl_secs: u64) -> StateResult<Lease> {
        self.check()?;
        self.inner.grant_lease(ttl_secs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StateResult<()> {
        self.check()?;
        self.inner.put_key(key, value, lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StateResult<Lease> {
        self.check()?;
        self.inner.keep_alive_lease(lease)
    }

    async fn revoke(&self, lease: LeaseId) -> StateResult<bool> {
        self.check()?;
        self.inner.revoke_lease(lease)
    }

    async fn get_prefix(&self, prefix: &str) -> StateResult<Vec<KeyValue>> {
        self.check()?;
        self.inner.list_prefix(prefix)
    }

    async fn delete_key(&self, key: &str) -> StateResult<bool> {
        self.check()?;
        self.inner.delete_key(key)
    }

    async fn watch(&self, prefix: &str) -> StateResult<mpsc::Receiver<WatchEvent>> {
        CoordinationStore::watch(&self.inner, prefix).await
    }
}
