//! Background expiry sweep.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::StateStore;

/// Periodically removes expired leases, their keys and stale cache
/// entries from a [`StateStore`].
pub struct Sweeper {
    store: StateStore,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: StateStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run until `shutdown` flips (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "expiry sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.store.sweep_expired() {
                        Ok(stats) if !stats.is_empty() => debug!(
                            leases = stats.leases,
                            keys = stats.keys,
                            cache_entries = stats.cache_entries,
                            "sweep removed expired records"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "expiry sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("expiry sweeper shutting down");
                    break;
                }
            }
        }
    }
}
