//! beacon-state: the coordination and cache store behind Beacon.
//!
//! Two async traits describe what the discovery and cache layers consume:
//!
//! - [`CoordinationStore`]: leases, lease-bound puts, prefix reads,
//!   deletes and prefix watches (an etcd-shaped surface).
//! - [`CacheStore`]: byte values with TTLs, set-if-absent and
//!   compare-and-delete (a redis-shaped surface).
//!
//! [`StateStore`] implements both on top of [redb](https://docs.rs/redb),
//! either on disk or fully in memory (the latter for tests). It is
//! `Clone` + `Send` + `Sync` (backed by `Arc<Database>`) and can be
//! shared across async tasks.
//!
//! # Expiry
//!
//! Expired leases and cache entries are invisible to reads immediately.
//! [`StateStore::sweep_expired`] physically removes them; keys bound to
//! an expired lease are removed in the same write transaction as the
//! lease itself. [`Sweeper`] runs it on an interval.

pub mod backend;
pub mod clock;
pub mod error;
pub mod store;
pub mod sweeper;
pub mod tables;
pub mod types;

pub use backend::{CacheStore, CoordinationStore};
pub use clock::Clock;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use sweeper::Sweeper;
pub use types::*;
