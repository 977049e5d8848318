//! redb table definitions for the Beacon state store.
//!
//! Coordination tables hold JSON-serialized records. The cache table
//! holds a raw layout (see `store::encode_cache_entry`) so payloads stay
//! opaque bytes.

use redb::TableDefinition;

/// Store-wide counters keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Lease records keyed by lease id.
pub const LEASES: TableDefinition<u64, &[u8]> = TableDefinition::new("leases");

/// Coordination keys (`{prefix}/{service}/{address}` and friends).
pub const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");

/// Cache entries keyed by cache key, including `lock:` tokens.
pub const CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

/// Key in [`META`] holding the next lease id to hand out.
pub const NEXT_LEASE_ID: &str = "next_lease_id";
