//! Resolver: turns a service prefix into a stream of address sets.
//!
//! A background task queries `{prefix}/{service}/` right away and then
//! on every poll interval. When `use_watch` is set it also subscribes to
//! the store's change events and re-queries as soon as one arrives;
//! polling stays on as the staleness bound.
//!
//! Every successful query replaces the whole set; identical consecutive
//! sets are not re-published. On failure the last good set is kept and
//! the loop retries with backoff. Consumers see a degraded signal only
//! after `failure_ceiling` consecutive failures spanning at least one
//! poll interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use beacon_core::config::ResolverSection;
use beacon_core::{AddressSet, ServiceKey};
use beacon_state::{CoordinationStore, WatchEvent};

use crate::backoff::Backoff;
use crate::error::DiscoveryError;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub prefix: String,
    pub poll_interval: Duration,
    /// Consecutive failures before consumers are told.
    pub failure_ceiling: u32,
    /// First retry delay after a failed query; doubles up to the poll
    /// interval.
    pub backoff_base: Duration,
    /// Re-query on store change events in addition to polling.
    pub use_watch: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            prefix: "/services".to_string(),
            poll_interval: Duration::from_secs(10),
            failure_ceiling: 3,
            backoff_base: Duration::from_millis(500),
            use_watch: true,
        }
    }
}

impl TryFrom<&ResolverSection> for ResolverConfig {
    type Error = DiscoveryError;

    fn try_from(section: &ResolverSection) -> Result<Self, Self::Error> {
        Ok(Self {
            prefix: section.prefix.clone(),
            poll_interval: section.poll_interval()?,
            failure_ceiling: section.failure_ceiling.max(1),
            backoff_base: section.backoff_base()?,
            use_watch: section.watch,
        })
    }
}

/// Latest state published by a resolver loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No query has succeeded yet.
    Pending,
    Resolved(AddressSet),
    /// Queries keep failing; `last_known` is the most recent good set.
    Degraded {
        failures: u32,
        last_known: AddressSet,
    },
    Closed,
}

/// Resolves service instances from a coordination store.
pub struct Resolver<C: CoordinationStore + ?Sized> {
    store: Arc<C>,
    config: ResolverConfig,
}

impl<C: CoordinationStore + ?Sized + 'static> Resolver<C> {
    pub fn new(store: Arc<C>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    /// Start resolving `service`. The first query runs immediately.
    pub async fn watch(&self, service: &str) -> ResolverHandle {
        let prefix = ServiceKey::service_prefix(&self.config.prefix, service);

        // Subscribe before the first query so no change slips in between.
        let events = if self.config.use_watch {
            match self.store.watch(&prefix).await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!(%prefix, error = %e, "watch unavailable, polling only");
                    None
                }
            }
        } else {
            None
        };

        let (tx, rx) = watch::channel(Resolution::Pending);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_resolve_loop(
            self.store.clone(),
            service.to_string(),
            prefix.clone(),
            self.config.clone(),
            events,
            tx,
            closed.clone(),
            shutdown_rx,
        ));

        info!(%service, %prefix, "resolver started");

        ResolverHandle {
            service: service.to_string(),
            rx,
            closed,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Handle to a running resolver loop.
pub struct ResolverHandle {
    service: String,
    // Never marked seen, so clones start out "changed".
    rx: watch::Receiver<Resolution>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ResolverHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// A new consumer stream. It starts at the latest published state.
    pub fn stream(&self) -> AddressStream {
        AddressStream {
            service: self.service.clone(),
            rx: self.rx.clone(),
        }
    }

    /// Stop the loop and wait for it to finish. Nothing is published
    /// after this returns; streams yield `None`.
    pub async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(service = %self.service, error = %e, "resolver task ended abnormally");
            }
            info!(service = %self.service, "resolver closed");
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

/// Pull-based view of a resolver: each `next` yields the latest state
/// not yet seen, skipping intermediate ones.
#[derive(Debug, Clone)]
pub struct AddressStream {
    service: String,
    rx: watch::Receiver<Resolution>,
}

impl AddressStream {
    /// Wait for the next update.
    ///
    /// `Ok` carries a complete address set, `Err` a
    /// [`DiscoveryError::ResolveTimeout`] with the last-known set. `None`
    /// once the resolver is closed.
    pub async fn next(&mut self) -> Option<Result<AddressSet, DiscoveryError>> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let state = self.rx.borrow_and_update().clone();
            match state {
                Resolution::Pending => continue,
                Resolution::Resolved(set) => return Some(Ok(set)),
                Resolution::Degraded {
                    failures,
                    last_known,
                } => {
                    return Some(Err(DiscoveryError::ResolveTimeout {
                        service: self.service.clone(),
                        failures,
                        last_known,
                    }));
                }
                Resolution::Closed => return None,
            }
        }
    }

    /// The most recent usable set, without waiting.
    pub fn current(&self) -> Option<AddressSet> {
        match &*self.rx.borrow() {
            Resolution::Resolved(set) => Some(set.clone()),
            Resolution::Degraded { last_known, .. } => Some(last_known.clone()),
            Resolution::Pending | Resolution::Closed => None,
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<WatchEvent>>) -> Option<WatchEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_resolve_loop<C: CoordinationStore + ?Sized>(
    store: Arc<C>,
    service: String,
    prefix: String,
    config: ResolverConfig,
    mut events: Option<mpsc::Receiver<WatchEvent>>,
    tx: watch::Sender<Resolution>,
    closed: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.backoff_base, config.poll_interval);
    let mut current: Option<AddressSet> = None;
    let mut degraded = false;
    // Start of the current run of failed queries.
    let mut failing_since: Option<Instant> = None;
    let mut wait = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            event = next_event(&mut events) => match event {
                Some(event) => {
                    debug!(%service, key = %event.key, kind = ?event.kind, "change event, re-querying");
                    // Coalesce a burst into a single query.
                    if let Some(rx) = events.as_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                }
                None => {
                    warn!(%service, "watch stream ended, polling only");
                    events = None;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        }

        if closed.load(Ordering::SeqCst) {
            break;
        }
        let result = store.get_prefix(&prefix).await;
        if closed.load(Ordering::SeqCst) {
            break;
        }

        match result {
            Ok(entries) => {
                backoff.record_success();
                failing_since = None;
                wait = config.poll_interval;

                let set = AddressSet::from_entries(entries.into_iter().map(|kv| (kv.key, kv.value)));
                if degraded || current.as_ref() != Some(&set) {
                    info!(%service, instances = set.len(), "address set updated");
                    degraded = false;
                    current = Some(set.clone());
                    tx.send_replace(Resolution::Resolved(set));
                } else {
                    debug!(%service, "address set unchanged");
                }
            }
            Err(e) => {
                wait = backoff.record_failure();
                let failures = backoff.consecutive_failures();
                let since = *failing_since.get_or_insert_with(Instant::now);
                warn!(%service, error = %e, failures, retry_in = ?wait, "resolve query failed");

                if failures >= config.failure_ceiling
                    && since.elapsed() >= config.poll_interval
                {
                    degraded = true;
                    tx.send_replace(Resolution::Degraded {
                        failures,
                        last_known: current.clone().unwrap_or_default(),
                    });
                }
            }
        }
    }

    tx.send_replace(Resolution::Closed);
    debug!(%service, "resolve loop stopped");
}
