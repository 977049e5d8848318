//! Registrar: keeps one service instance published under a lease.
//!
//! `start` grants a lease, writes `{prefix}/{service}/{address}` bound to
//! it, and spawns a renewal task. The task renews every `ttl / 2` (at most
//! `ttl - 1s`), backs off on transient failures, and re-grants a fresh
//! lease when the store reports the old one gone. An expired lease is
//! never resumed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use beacon_core::ServiceAddress;
use beacon_core::ServiceKey;
use beacon_core::config::RegistrarSection;
use beacon_state::{CoordinationStore, Lease, LeaseId, StateError, StateResult};

use crate::backoff::Backoff;
use crate::error::DiscoveryError;

/// Registrar settings, usually built from the `[registrar]` section.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Key prefix services are published under, e.g. `/services`.
    pub prefix: String,
    /// Lease TTL. Leases are granted in whole seconds.
    pub ttl: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Attempts `start` makes before giving up.
    pub start_attempts: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            prefix: "/services".to_string(),
            ttl: Duration::from_secs(10),
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(5),
            start_attempts: 5,
        }
    }
}

impl TryFrom<&RegistrarSection> for RegistrarConfig {
    type Error = DiscoveryError;

    fn try_from(section: &RegistrarSection) -> Result<Self, Self::Error> {
        Ok(Self {
            prefix: section.prefix.clone(),
            ttl: section.ttl()?,
            retry_base: section.retry_base()?,
            retry_max: section.retry_max()?,
            start_attempts: section.start_attempts.max(1),
        })
    }
}

impl RegistrarConfig {
    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    /// Delay between renewals: half the TTL, never longer than `ttl - 1s`.
    pub fn renew_interval(&self) -> Duration {
        let ttl = Duration::from_secs(self.ttl_secs());
        let half = ttl / 2;
        if ttl > Duration::from_secs(1) {
            half.min(ttl - Duration::from_secs(1))
        } else {
            half
        }
    }
}

/// Publishes service instances into a coordination store.
pub struct Registrar<C: CoordinationStore + ?Sized> {
    store: Arc<C>,
    config: RegistrarConfig,
}

impl<C: CoordinationStore + ?Sized + 'static> Registrar<C> {
    pub fn new(store: Arc<C>, config: RegistrarConfig) -> Self {
        Self { store, config }
    }

    /// Register `address` as an instance of `service` and keep it alive
    /// until the returned handle is stopped or dropped.
    ///
    /// Transient store failures are retried with backoff up to
    /// `start_attempts` times. If a previous lease still holds the key
    /// (a restart at the same address), start waits up to one TTL plus
    /// `retry_max` for it to lapse before failing with
    /// [`DiscoveryError::AddressTaken`].
    pub async fn start(
        &self,
        service: &str,
        address: &ServiceAddress,
    ) -> Result<RegistrarHandle, DiscoveryError> {
        let key = ServiceKey::new(&self.config.prefix, service, address.clone()).to_string();
        let value = address.to_string();
        let ttl_secs = self.config.ttl_secs();
        let mut backoff = Backoff::new(self.config.retry_base, self.config.retry_max);
        let takeover_deadline =
            Instant::now() + Duration::from_secs(ttl_secs) + self.config.retry_max;

        let mut attempt = 0;
        let lease = loop {
            let err = match publish(&*self.store, &key, &value, ttl_secs).await {
                Ok(lease) => break lease,
                Err(e) => e,
            };

            if let StateError::KeyLeased { lease: holder, .. } = &err {
                let now = Instant::now();
                if now >= takeover_deadline {
                    warn!(%key, %holder, "address still held by another lease");
                    return Err(DiscoveryError::AddressTaken {
                        key,
                        holder: *holder,
                    });
                }
                let delay = backoff.record_failure().min(takeover_deadline - now);
                info!(%key, %holder, ?delay, "waiting for previous lease to lapse");
                tokio::time::sleep(delay).await;
                continue;
            }

            attempt += 1;
            if err.is_transient() && attempt < self.config.start_attempts {
                let delay = backoff.record_failure();
                warn!(%key, attempt, error = %err, ?delay, "registration failed, retrying");
                tokio::time::sleep(delay).await;
            } else {
                warn!(%key, attempt, error = %err, "registration failed");
                return Err(DiscoveryError::StoreUnavailable(err));
            }
        };

        info!(%key, lease = %lease.id, ttl_secs, "service registered");

        let (signal_tx, signal_rx) = watch::channel(Signal::Run);
        let (lease_tx, lease_rx) = watch::channel(lease.id);
        let task = tokio::spawn(run_renewal_loop(
            self.store.clone(),
            key.clone(),
            value,
            self.config.clone(),
            lease.id,
            lease_tx,
            signal_rx,
        ));

        Ok(RegistrarHandle {
            key,
            lease: lease_rx,
            signal: signal_tx,
            task: Some(task),
        })
    }
}

/// What the renewal task should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    /// Stop renewing and revoke the lease.
    Release,
    /// Stop renewing and let the lease expire.
    Abandon,
}

/// Handle to a running registration.
///
/// Dropping it without calling [`stop`](Self::stop) cancels renewal; the
/// key then disappears once the lease runs out.
pub struct RegistrarHandle {
    key: String,
    lease: watch::Receiver<LeaseId>,
    signal: watch::Sender<Signal>,
    task: Option<JoinHandle<()>>,
}

impl RegistrarHandle {
    /// The published store key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The lease currently backing the key.
    pub fn lease_id(&self) -> LeaseId {
        *self.lease.borrow()
    }

    /// Cancel renewal and revoke the lease. A failed revoke is logged
    /// and the lease is left to expire.
    pub async fn stop(mut self) {
        self.signal.send_replace(Signal::Release);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(key = %self.key, error = %e, "renewal task ended abnormally");
            }
        }
    }
}

impl Drop for RegistrarHandle {
    fn drop(&mut self) {
        self.signal.send_if_modified(|signal| {
            if *signal == Signal::Run {
                *signal = Signal::Abandon;
                true
            } else {
                false
            }
        });
    }
}

/// Grant a lease and bind `key` to it. A lease whose put fails is
/// revoked on a best-effort basis.
async fn publish<C: CoordinationStore + ?Sized>(
    store: &C,
    key: &str,
    value: &str,
    ttl_secs: u64,
) -> StateResult<Lease> {
    let lease = store.grant(ttl_secs).await?;
    if let Err(e) = store.put(key, value, Some(lease.id)).await {
        if let Err(revoke_err) = store.revoke(lease.id).await {
            debug!(%key, lease = %lease.id, error = %revoke_err, "orphan lease left to expire");
        }
        return Err(e);
    }
    Ok(lease)
}

async fn renew<C: CoordinationStore + ?Sized>(
    store: &C,
    key: &str,
    value: &str,
    ttl_secs: u64,
    lease: LeaseId,
) -> Result<LeaseId, DiscoveryError> {
    match store.keep_alive(lease).await {
        Ok(_) => Ok(lease),
        Err(e) => match DiscoveryError::from_store(e, lease) {
            DiscoveryError::LeaseExpired(old) => {
                warn!(%key, lease = %old, "lease expired, re-registering");
                let fresh = publish(store, key, value, ttl_secs)
                    .await
                    .map_err(|e| DiscoveryError::from_store(e, old))?;
                info!(%key, lease = %fresh.id, "service re-registered");
                Ok(fresh.id)
            }
            other => Err(other),
        },
    }
}

async fn run_renewal_loop<C: CoordinationStore + ?Sized>(
    store: Arc<C>,
    key: String,
    value: String,
    config: RegistrarConfig,
    mut lease: LeaseId,
    lease_tx: watch::Sender<LeaseId>,
    mut signal: watch::Receiver<Signal>,
) {
    let interval = config.renew_interval();
    let ttl_secs = config.ttl_secs();
    let mut backoff = Backoff::new(config.retry_base, config.retry_max);
    let mut wait = interval;

    debug!(%key, ?interval, "renewal loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = signal.changed() => break,
        }

        match renew(&*store, &key, &value, ttl_secs, lease).await {
            Ok(current) => {
                if current != lease {
                    lease = current;
                    lease_tx.send_replace(lease);
                }
                backoff.record_success();
                wait = interval;
                debug!(%key, %lease, "lease renewed");
            }
            Err(e) => {
                wait = backoff.record_failure().min(interval);
                warn!(
                    %key,
                    %lease,
                    error = %e,
                    failures = backoff.consecutive_failures(),
                    retry_in = ?wait,
                    "lease renewal failed"
                );
            }
        }
    }

    let release = *signal.borrow() == Signal::Release;
    if release {
        match store.revoke(lease).await {
            Ok(_) => info!(%key, %lease, "service deregistered"),
            Err(e) => warn!(%key, %lease, error = %e, "revoke failed, lease left to expire"),
        }
    } else {
        debug!(%key, %lease, "renewal cancelled, lease left to expire");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use beacon_state::StateStore;

    fn config() -> RegistrarConfig {
        RegistrarConfig {
            prefix: "/services/myweb".to_string(),
            ttl: Duration::from_secs(10),
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(2),
            start_attempts: 3,
        }
    }

    fn addr() -> ServiceAddress {
        ServiceAddress::new("10.0.0.1", 50051)
    }

    #[test]
    fn renew_interval_is_half_ttl_capped() {
        let mut c = config();
        assert_eq!(c.renew_interval(), Duration::from_secs(5));
        c.ttl = Duration::from_secs(1);
        assert_eq!(c.renew_interval(), Duration::from_millis(500));
        c.ttl = Duration::from_secs(2);
        assert_eq!(c.renew_interval(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn start_publishes_leased_key() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let registrar = Registrar::new(store.clone(), config());
        let handle = registrar.start("user", &addr()).await.unwrap();

        assert_eq!(handle.key(), "/services/myweb/user/10.0.0.1:50051");
        let kv = store.get_key(handle.key()).unwrap().unwrap();
        assert_eq!(kv.value, "10.0.0.1:50051");
        assert_eq!(kv.lease, Some(handle.lease_id()));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_outlives_ttl() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let registrar = Registrar::new(store.clone(), config());
        let handle = registrar.start("user", &addr()).await.unwrap();
        let lease = handle.lease_id();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(store.get_key(handle.key()).unwrap().is_some());
        assert_eq!(handle.lease_id(), lease);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_revokes_immediately() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let registrar = Registrar::new(store.clone(), config());
        let handle = registrar.start("user", &addr()).await.unwrap();
        let key = handle.key().to_string();

        handle.stop().await;
        assert!(store.get_key(&key).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_lets_lease_expire() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let registrar = Registrar::new(store.clone(), config());
        let handle = registrar.start("user", &addr()).await.unwrap();
        let key = handle.key().to_string();
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.get_key(&key).unwrap().is_some());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.get_key(&key).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn regrants_after_lease_expired_during_outage() {
        let store = FlakyStore::new();
        let registrar = Registrar::new(store.clone(), config());
        let handle = registrar.start("user", &addr()).await.unwrap();
        let first = handle.lease_id();

        store.set_down(true);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(store.inner.get_key(handle.key()).unwrap().is_none());

        store.set_down(false);
        tokio::time::sleep(Duration::from_secs(6)).await;

        let second = handle.lease_id();
        assert_ne!(first, second);
        let kv = store.inner.get_key(handle.key()).unwrap().unwrap();
        assert_eq!(kv.lease, Some(second));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_retries_transient_failures() {
        let store = FlakyStore::new();
        store.set_down(true);
        let registrar = Registrar::new(store.clone(), config());

        let flip = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(700)).await;
                store.set_down(false);
            })
        };

        let handle = registrar.start("user", &addr()).await.unwrap();
        flip.await.unwrap();
        assert!(store.inner.get_key(handle.key()).unwrap().is_some());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_gives_up_after_attempts() {
        let store = FlakyStore::new();
        store.set_down(true);
        let registrar = Registrar::new(store, config());

        let err = registrar.start("user", &addr()).await.err().unwrap();
        assert!(matches!(err, DiscoveryError::StoreUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_waits_for_previous_lease_to_lapse() {
        let store = FlakyStore::new();
        let previous = store.inner.grant_lease(10).unwrap();
        store
            .inner
            .put_key("/services/myweb/user/10.0.0.1:50051", "10.0.0.1:50051", Some(previous.id))
            .unwrap();
        let registrar = Registrar::new(store.clone(), config());

        let started = Instant::now();
        let handle = registrar.start("user", &addr()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_ne!(handle.lease_id(), previous.id);

        let kv = store.inner.get_key(handle.key()).unwrap().unwrap();
        assert_eq!(kv.lease, Some(handle.lease_id()));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_holder_is_reported_as_address_taken() {
        let store = FlakyStore::new();
        let holder = store.inner.grant_lease(10).unwrap();
        store
            .inner
            .put_key("/services/myweb/user/10.0.0.1:50051", "10.0.0.1:50051", Some(holder.id))
            .unwrap();
        let keeper = {
            let inner = store.inner.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    if inner.keep_alive_lease(holder.id).is_err() {
                        break;
                    }
                }
            })
        };
        let registrar = Registrar::new(store.clone(), config());

        let err = registrar.start("user", &addr()).await.err().unwrap();
        match err {
            DiscoveryError::AddressTaken { key, holder: id } => {
                assert_eq!(key, "/services/myweb/user/10.0.0.1:50051");
                assert_eq!(id, holder.id);
            }
            other => panic!("expected AddressTaken, got {other:?}"),
        }
        // The holder keeps the key.
        let kv = store.inner.get_key("/services/myweb/user/10.0.0.1:50051").unwrap().unwrap();
        assert_eq!(kv.lease, Some(holder.id));
        keeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_revoke_on_stop_is_not_fatal() {
        let store = FlakyStore::new();
        let registrar = Registrar::new(store.clone(), config());
        let handle = registrar.start("user", &addr()).await.unwrap();
        let key = handle.key().to_string();

        store.set_down(true);
        handle.stop().await;
        store.set_down(false);

        // Revoke never reached the store; the lease runs out on its own.
        assert!(store.inner.get_key(&key).unwrap().is_some());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.inner.get_key(&key).unwrap().is_none());
    }
}
