//! GuardedCache: read-or-claim over a [`CacheStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use beacon_core::config::CacheSection;
use beacon_state::CacheStore;

use crate::entry::{self, Cached};
use crate::error::CacheError;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix of lock keys; the lock for `k` is `{lock_prefix}{k}`.
    pub lock_prefix: String,
    /// Lifetime of a lock token, bounding how long a crashed loader
    /// blocks others.
    pub lock_ttl: Duration,
    /// Pause between re-reads while another caller loads.
    pub retry_interval: Duration,
    /// Total time a caller waits for someone else's load.
    pub wait_deadline: Duration,
    /// Upper bound of the random extra TTL added by `fill`.
    pub fill_jitter: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_prefix: "lock:".to_string(),
            lock_ttl: Duration::from_secs(3),
            retry_interval: Duration::from_millis(50),
            wait_deadline: Duration::from_secs(3),
            fill_jitter: Duration::ZERO,
        }
    }
}

impl TryFrom<&CacheSection> for CacheConfig {
    type Error = CacheError;

    fn try_from(section: &CacheSection) -> Result<Self, Self::Error> {
        Ok(Self {
            lock_prefix: section.lock_prefix.clone(),
            lock_ttl: section.lock_ttl()?,
            retry_interval: section.retry_interval()?,
            wait_deadline: section.wait_deadline()?,
            fill_jitter: section.fill_jitter()?,
        })
    }
}

/// Proof that this caller holds the load lock for a key.
///
/// Hand it back to [`GuardedCache::release`] once the value is filled.
#[must_use = "a claim should be released after filling the key"]
#[derive(Debug)]
pub struct Claim {
    key: String,
    lock_key: String,
    token: [u8; 16],
}

impl Claim {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Outcome of [`GuardedCache::read_or_claim`].
#[derive(Debug)]
pub enum Lookup {
    Cached(Cached),
    /// Nothing cached and this caller now owns the load.
    Claimed(Claim),
}

pub struct GuardedCache<S: CacheStore + ?Sized> {
    store: Arc<S>,
    config: CacheConfig,
}

impl<S: CacheStore + ?Sized> GuardedCache<S> {
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.config.lock_prefix, key)
    }

    /// Plain read. `None` is a true miss.
    pub async fn read(&self, key: &str) -> Result<Option<Cached>, CacheError> {
        match self.store.get(key).await? {
            Some(raw) => entry::decode(raw)
                .map(Some)
                .ok_or_else(|| CacheError::Corrupt {
                    key: key.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Read `key`, or take the right to load it.
    ///
    /// While another caller holds the lock this re-reads every
    /// `retry_interval`; after `wait_deadline` it fails with
    /// [`CacheError::LoadTimeout`]. Transient store failures are retried
    /// on the same schedule and surface as
    /// [`CacheError::StoreUnavailable`] only if the store is still down
    /// at the deadline.
    pub async fn read_or_claim(&self, key: &str) -> Result<Lookup, CacheError> {
        let lock_key = self.lock_key(key);
        let deadline = Instant::now() + self.config.wait_deadline;
        let mut attempts = 0u32;

        loop {
            let failure = match self.try_claim(key, &lock_key).await {
                Ok(Some(lookup)) => {
                    debug!(%key, attempts, "lookup settled");
                    return Ok(lookup);
                }
                Ok(None) => None,
                Err(e) if e.is_transient() => {
                    debug!(%key, attempts, error = %e, "cache store unavailable, retrying");
                    Some(e)
                }
                Err(e) => return Err(e),
            };

            attempts += 1;
            let now = Instant::now();
            if now >= deadline {
                if let Some(e) = failure {
                    warn!(%key, attempts, error = %e, "cache store still unavailable");
                    return Err(e);
                }
                warn!(%key, attempts, waited = ?self.config.wait_deadline, "gave up waiting for load");
                return Err(CacheError::LoadTimeout {
                    key: key.to_string(),
                    waited: self.config.wait_deadline,
                });
            }
            tokio::time::sleep(self.config.retry_interval.min(deadline - now)).await;
        }
    }

    /// One read-then-claim round. `None` means someone else is loading.
    async fn try_claim(&self, key: &str, lock_key: &str) -> Result<Option<Lookup>, CacheError> {
        if let Some(hit) = self.read(key).await? {
            return Ok(Some(Lookup::Cached(hit)));
        }

        let token: [u8; 16] = rand::random();
        if !self
            .store
            .set_if_absent(lock_key, &token, self.config.lock_ttl)
            .await?
        {
            return Ok(None);
        }
        let claim = Claim {
            key: key.to_string(),
            lock_key: lock_key.to_string(),
            token,
        };

        // A fill may have landed between the read and the claim.
        match self.read(key).await {
            Ok(Some(hit)) => {
                if let Err(e) = self.release(claim).await {
                    debug!(%key, error = %e, "load lock left to expire");
                }
                Ok(Some(Lookup::Cached(hit)))
            }
            Ok(None) => {
                debug!(%key, "load lock claimed");
                Ok(Some(Lookup::Claimed(claim)))
            }
            Err(e) => {
                if let Err(release_err) = self.release(claim).await {
                    debug!(%key, error = %release_err, "load lock left to expire");
                }
                Err(e)
            }
        }
    }

    /// Store a loaded value. `None` TTL keeps it until invalidated.
    pub async fn fill(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.map(|ttl| ttl + self.jitter());
        self.store.set(key, &entry::encode_value(value), ttl).await?;
        debug!(%key, bytes = value.len(), ?ttl, "cache filled");
        Ok(())
    }

    pub async fn fill_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.fill(key, &bytes, ttl).await
    }

    /// Record that `key` does not exist upstream, for exactly `ttl`.
    pub async fn mark_absent(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.store.set(key, &entry::encode_absent(), Some(ttl)).await?;
        debug!(%key, ?ttl, "cache marked absent");
        Ok(())
    }

    /// Give up a claim. Returns false if the lock had already expired or
    /// now belongs to someone else; that is not an error.
    pub async fn release(&self, claim: Claim) -> Result<bool, CacheError> {
        let released = self
            .store
            .compare_and_delete(&claim.lock_key, &claim.token)
            .await?;
        if released {
            debug!(key = %claim.key, "load lock released");
        } else {
            debug!(key = %claim.key, "load lock already lost");
        }
        Ok(released)
    }

    /// Drop a cached value or absent marker.
    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self.store.delete(key).await?;
        debug!(%key, removed, "cache invalidated");
        Ok(removed)
    }

    /// Whether anything (value or absent marker) is cached for `key`.
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store.exists(key).await?)
    }

    /// Cache-aside in one call.
    ///
    /// On a miss the loader runs in exactly one caller; `Ok(None)` from
    /// it is cached as absent for `absent_ttl`. The claim is released
    /// whether or not loading succeeded.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        absent_ttl: Duration,
        loader: F,
    ) -> Result<Option<Vec<u8>>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>>,
    {
        let claim = match self.read_or_claim(key).await? {
            Lookup::Cached(hit) => return Ok(hit.into_value()),
            Lookup::Claimed(claim) => claim,
        };

        let outcome = match loader().await {
            Ok(Some(value)) => self.fill(key, &value, ttl).await.map(|_| Some(value)),
            Ok(None) => self.mark_absent(key, absent_ttl).await.map(|_| None),
            Err(e) => Err(CacheError::Loader(e)),
        };

        if let Err(e) = self.release(claim).await {
            warn!(%key, error = %e, "failed to release load lock, it will expire");
        }
        outcome
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.fill_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
