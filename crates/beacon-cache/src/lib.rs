//! beacon-cache: a TTL cache that lets one caller load a missing key
//! while everyone else waits.
//!
//! On a miss, [`GuardedCache::read_or_claim`] tries to take the lock key
//! `lock:<key>` with an atomic set-if-absent. The winner gets a
//! [`Claim`], loads the value, calls [`fill`](GuardedCache::fill) or
//! [`mark_absent`](GuardedCache::mark_absent), and then
//! [`release`](GuardedCache::release)s the claim. Losers re-read every
//! `retry_interval` until the value shows up or `wait_deadline` passes.
//!
//! Values that are known not to exist are cached too (as an absent
//! marker), so repeated lookups of missing rows do not reach the loader.

pub mod cache;
pub mod entry;
pub mod error;

pub use cache::{CacheConfig, Claim, GuardedCache, Lookup};
pub use entry::Cached;
pub use error::CacheError;
