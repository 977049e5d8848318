//! Records exchanged with (and persisted by) the Beacon state store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A time-bounded ownership token. Keys bound to it vanish when it is
/// neither renewed nor revoked within `ttl_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl_secs: u64,
}

/// One coordination key as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Put,
    Delete,
}

/// A change notification for a key under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for `Put`, `None` for `Delete`.
    pub value: Option<String>,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: None,
        }
    }
}

/// Counts of records removed by one expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub leases: u32,
    pub keys: u32,
    pub cache_entries: u32,
}

impl SweepStats {
    pub fn is_empty(&self) -> bool {
        self.leases == 0 && self.keys == 0 && self.cache_entries == 0
    }
}

// ── Persisted records ─────────────────────────────────────────────

/// Lease row in the `leases` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct LeaseRecord {
    pub id: u64,
    pub ttl_secs: u64,
    /// Store-clock milliseconds after which the lease is dead.
    pub expires_at_ms: u64,
}

impl LeaseRecord {
    pub fn is_alive(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Key row in the `keys` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct KeyRecord {
    pub value: String,
    pub lease: Option<LeaseId>,
}
