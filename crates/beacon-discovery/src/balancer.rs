//! Round-robin balancer over resolved addresses.
//!
//! Holds the latest address set from a resolver and hands out addresses
//! in turn using an atomic counter. On a degraded signal it keeps
//! serving the last-known set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use beacon_core::{AddressSet, ServiceAddress};

use crate::resolver::AddressStream;

pub struct Balancer {
    addresses: RwLock<Vec<ServiceAddress>>,
    counter: AtomicUsize,
}

impl Balancer {
    pub fn new() -> Self {
        Self {
            addresses: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Replace the address pool with `set`.
    pub fn update(&self, set: &AddressSet) {
        let mut addresses = self
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *addresses = set.addresses().cloned().collect();
        debug!(count = addresses.len(), "balancer pool updated");
    }

    /// Select the next address (round-robin). `None` when the pool is empty.
    pub fn next(&self) -> Option<ServiceAddress> {
        let addresses = self
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if addresses.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % addresses.len();
        Some(addresses[idx].clone())
    }

    pub fn snapshot(&self) -> Vec<ServiceAddress> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the pool in sync with `stream` until the resolver closes.
    pub fn follow(self: &Arc<Self>, mut stream: AddressStream) -> JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(update) = stream.next().await {
                match update {
                    Ok(set) => balancer.update(&set),
                    Err(e) => warn!(error = %e, "resolver degraded, keeping last-known addresses"),
                }
            }
            debug!("balancer stopped following resolver");
        })
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}
