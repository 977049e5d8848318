//! StateStore: redb-backed coordination and cache store.
//!
//! Provides leases, lease-bound keys with prefix reads, and TTL'd cache
//! entries. Coordination records are JSON-serialized into redb's `&[u8]`
//! value columns; cache entries use a raw `expiry ++ payload` layout.
//! Mutations of coordination keys are published on a broadcast channel
//! that backs prefix watches.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Capacity of the change-event broadcast channel.
const EVENT_BUFFER: usize = 256;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    clock: Clock,
    events: broadcast::Sender<WatchEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let store = Self {
            db: Arc::new(db),
            clock: Clock::new(),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.open_table(KEYS).map_err(map_err!(Table))?;
        txn.open_table(CACHE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The clock all deadlines in this store are measured against.
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Subscribe to every coordination-key change in this store.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: impl IntoIterator<Item = WatchEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Grant a new lease that lives `ttl_secs` unless renewed.
    pub fn grant_lease(&self, ttl_secs: u64) -> StateResult<Lease> {
        if ttl_secs == 0 {
            return Err(StateError::Invalid(
                "lease ttl must be at least one second".to_string(),
            ));
        }
        let record_expiry = self.clock.deadline_ms(Duration::from_secs(ttl_secs));
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            id = meta
                .get(NEXT_LEASE_ID)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(1);
            meta.insert(NEXT_LEASE_ID, id + 1).map_err(map_err!(Write))?;

            let record = LeaseRecord {
                id,
                ttl_secs,
                expires_at_ms: record_expiry,
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            leases.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lease = id, ttl_secs, "lease granted");
        Ok(Lease {
            id: LeaseId(id),
            ttl_secs,
        })
    }

    /// Extend a live lease by its full TTL.
    ///
    /// A lease found expired is reaped on the spot (with its keys) and
    /// reported as `LeaseNotFound`; it is never resurrected.
    pub fn keep_alive_lease(&self, id: LeaseId) -> StateResult<Lease> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed;
        let mut removed = Vec::new();
        {
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            match read_lease(&leases, id.0)? {
                Some(mut record) if record.is_alive(now) => {
                    record.expires_at_ms = now + record.ttl_secs * 1000;
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    leases.insert(id.0, value.as_slice()).map_err(map_err!(Write))?;
                    renewed = Some(Lease {
                        id,
                        ttl_secs: record.ttl_secs,
                    });
                }
                Some(_) => {
                    leases.remove(id.0).map_err(map_err!(Write))?;
                    let mut keys = txn.open_table(KEYS).map_err(map_err!(Table))?;
                    removed = remove_keys_for_leases(&mut keys, &HashSet::from([id]))?;
                    renewed = None;
                }
                None => renewed = None,
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        match renewed {
            Some(lease) => {
                debug!(lease = %id, "lease renewed");
                Ok(lease)
            }
            None => {
                self.publish(removed.into_iter().map(WatchEvent::delete));
                Err(StateError::LeaseNotFound(id))
            }
        }
    }

    /// Drop a lease and every key bound to it. Returns true if the lease
    /// was still known to the store.
    pub fn revoke_lease(&self, id: LeaseId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let removed;
        {
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            existed = leases.remove(id.0).map_err(map_err!(Write))?.is_some();
            let mut keys = txn.open_table(KEYS).map_err(map_err!(Table))?;
            removed = remove_keys_for_leases(&mut keys, &HashSet::from([id]))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(lease = %id, existed, keys = removed.len(), "lease revoked");
        self.publish(removed.into_iter().map(WatchEvent::delete));
        Ok(existed)
    }

    // ── Keys ───────────────────────────────────────────────────────

    /// Insert or update a key, optionally bound to a live lease.
    ///
    /// Fails with `KeyLeased` when the key is currently held by a
    /// different live lease.
    pub fn put_key(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StateResult<()> {
        let now = self.clock.now_ms();
        let record = KeyRecord {
            value: value.to_string(),
            lease,
        };
        let encoded = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            if let Some(id) = lease {
                if !lease_alive(&leases, id, now)? {
                    return Err(StateError::LeaseNotFound(id));
                }
            }

            let mut keys = txn.open_table(KEYS).map_err(map_err!(Table))?;
            if let Some(existing) = read_key(&keys, key)? {
                if let Some(holder) = existing.lease {
                    if Some(holder) != lease && lease_alive(&leases, holder, now)? {
                        return Err(StateError::KeyLeased {
                            key: key.to_string(),
                            lease: holder,
                        });
                    }
                }
            }
            keys.insert(key, encoded.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, lease = ?lease, "key stored");
        self.publish([WatchEvent::put(key, value)]);
        Ok(())
    }

    /// Get a single visible key.
    pub fn get_key(&self, key: &str) -> StateResult<Option<KeyValue>> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
        let keys = txn.open_table(KEYS).map_err(map_err!(Table))?;
        match read_key(&keys, key)? {
            Some(record) if visible(&leases, &record, now)? => Ok(Some(KeyValue {
                key: key.to_string(),
                value: record.value,
                lease: record.lease,
            })),
            _ => Ok(None),
        }
    }

    /// List every visible key starting with `prefix`, in key order.
    ///
    /// Keys whose lease has expired are skipped even before a sweep
    /// removes them.
    pub fn list_prefix(&self, prefix: &str) -> StateResult<Vec<KeyValue>> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
        let keys = txn.open_table(KEYS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in keys.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let record: KeyRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if visible(&leases, &record, now)? {
                results.push(KeyValue {
                    key: key.to_string(),
                    value: record.value,
                    lease: record.lease,
                });
            }
        }
        Ok(results)
    }

    /// Delete a key. Returns true if it existed.
    pub fn delete_key(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut keys = txn.open_table(KEYS).map_err(map_err!(Table))?;
            existed = keys.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "key deleted");
        if existed {
            self.publish([WatchEvent::delete(key)]);
        }
        Ok(existed)
    }

    // ── Cache ──────────────────────────────────────────────────────

    /// Get a live cache payload.
    pub fn cache_get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CACHE).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let (expires_at, payload) = decode_cache_entry(guard.value())?;
                if is_expired(expires_at, now) {
                    Ok(None)
                } else {
                    Ok(Some(payload.to_vec()))
                }
            }
            None => Ok(None),
        }
    }

    /// Store a cache payload; `None` TTL means no expiry.
    pub fn cache_set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
        let expires_at = ttl.map(|ttl| self.clock.deadline_ms(ttl));
        let encoded = encode_cache_entry(value, expires_at);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CACHE).map_err(map_err!(Table))?;
            table
                .insert(key, encoded.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, bytes = value.len(), ?ttl, "cache entry stored");
        Ok(())
    }

    /// Store a payload only if no live entry exists. Returns true if stored.
    pub fn cache_set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StateResult<bool> {
        let now = self.clock.now_ms();
        let encoded = encode_cache_entry(value, Some(self.clock.deadline_ms(ttl)));
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CACHE).map_err(map_err!(Table))?;
            if live_cache_payload(&table, key, now)?.is_some() {
                return Ok(false);
            }
            table
                .insert(key, encoded.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Remove a cache entry. Returns true if a live entry was removed.
    pub fn cache_delete(&self, key: &str) -> StateResult<bool> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CACHE).map_err(map_err!(Table))?;
            existed = live_cache_payload(&table, key, now)?.is_some();
            table.remove(key).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn cache_exists(&self, key: &str) -> StateResult<bool> {
        Ok(self.cache_get(key)?.is_some())
    }

    /// Remove a live entry only if its payload equals `expected`.
    pub fn cache_compare_and_delete(&self, key: &str, expected: &[u8]) -> StateResult<bool> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CACHE).map_err(map_err!(Table))?;
            match live_cache_payload(&table, key, now)? {
                Some(payload) if payload == expected => {
                    table.remove(key).map_err(map_err!(Write))?;
                }
                _ => return Ok(false),
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    // ── Expiry ─────────────────────────────────────────────────────

    /// Physically remove expired leases (with their keys), keys bound to
    /// leases that no longer exist, and expired cache entries.
    pub fn sweep_expired(&self) -> StateResult<SweepStats> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut stats = SweepStats::default();
        let removed_keys;
        {
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let mut live = HashSet::new();
            let mut expired = HashSet::new();
            for entry in leases.iter().map_err(map_err!(Read))? {
                let (id, value) = entry.map_err(map_err!(Read))?;
                let record: LeaseRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.is_alive(now) {
                    live.insert(LeaseId(id.value()));
                } else {
                    expired.insert(LeaseId(id.value()));
                }
            }
            for id in &expired {
                leases.remove(id.0).map_err(map_err!(Write))?;
            }
            stats.leases = expired.len() as u32;

            let mut keys = txn.open_table(KEYS).map_err(map_err!(Table))?;
            let mut doomed = Vec::new();
            for entry in keys.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: KeyRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if let Some(lease) = record.lease {
                    if !live.contains(&lease) {
                        doomed.push(key.value().to_string());
                    }
                }
            }
            for key in &doomed {
                keys.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            stats.keys = doomed.len() as u32;
            removed_keys = doomed;

            let mut cache = txn.open_table(CACHE).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in cache.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let (expires_at, _) = decode_cache_entry(value.value())?;
                if is_expired(expires_at, now) {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                cache.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            stats.cache_entries = stale.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if !stats.is_empty() {
            debug!(
                leases = stats.leases,
                keys = stats.keys,
                cache_entries = stats.cache_entries,
                "expired records swept"
            );
        }
        self.publish(removed_keys.into_iter().map(WatchEvent::delete));
        Ok(stats)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn read_lease(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<LeaseRecord>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: LeaseRecord =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn lease_alive(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: LeaseId,
    now_ms: u64,
) -> StateResult<bool> {
    Ok(read_lease(table, id.0)?.is_some_and(|record| record.is_alive(now_ms)))
}

fn read_key(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<KeyRecord>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: KeyRecord =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Whether a key is visible to readers: unleased, or bound to a live lease.
fn visible(
    leases: &impl ReadableTable<u64, &'static [u8]>,
    record: &KeyRecord,
    now_ms: u64,
) -> StateResult<bool> {
    match record.lease {
        Some(id) => lease_alive(leases, id, now_ms),
        None => Ok(true),
    }
}

/// Remove every key bound to one of `ids`, returning the removed keys.
fn remove_keys_for_leases(
    keys: &mut Table<'_, &'static str, &'static [u8]>,
    ids: &HashSet<LeaseId>,
) -> StateResult<Vec<String>> {
    let mut bound = Vec::new();
    for entry in keys.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let record: KeyRecord =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if record.lease.is_some_and(|id| ids.contains(&id)) {
            bound.push(key.value().to_string());
        }
    }
    for key in &bound {
        keys.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(bound)
}

fn live_cache_payload(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
    now_ms: u64,
) -> StateResult<Option<Vec<u8>>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let (expires_at, payload) = decode_cache_entry(guard.value())?;
            if is_expired(expires_at, now_ms) {
                Ok(None)
            } else {
                Ok(Some(payload.to_vec()))
            }
        }
        None => Ok(None),
    }
}

/// Cache rows are `expires_at_ms (u64 BE, 0 = never) ++ payload`.
fn encode_cache_entry(payload: &[u8], expires_at_ms: Option<u64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&expires_at_ms.unwrap_or(0).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode_cache_entry(raw: &[u8]) -> StateResult<(Option<u64>, &[u8])> {
    let (head, payload) = raw
        .split_first_chunk::<8>()
        .ok_or_else(|| StateError::Deserialize("cache entry shorter than its header".to_string()))?;
    let expires_at = u64::from_be_bytes(*head);
    Ok(((expires_at != 0).then_some(expires_at), payload))
}

fn is_expired(expires_at_ms: Option<u64>, now_ms: u64) -> bool {
    expires_at_ms.is_some_and(|deadline| deadline <= now_ms)
}
