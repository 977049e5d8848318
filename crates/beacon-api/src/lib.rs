//! beacon-api: HTTP surface of the Beacon store.
//!
//! [`build_router`] exposes a [`StateStore`] over HTTP/1.1 so that
//! registrars, resolvers and caches in other processes can share it.
//! [`RemoteStore`] is the matching client; it implements both
//! [`CoordinationStore`](beacon_state::CoordinationStore) and
//! [`CacheStore`](beacon_state::CacheStore), so callers cannot tell it
//! apart from the embedded store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/leases` | Grant a lease |
//! | POST | `/v1/leases/{id}/keepalive` | Renew a lease |
//! | DELETE | `/v1/leases/{id}` | Revoke a lease and its keys |
//! | PUT | `/v1/kv` | Put a key, optionally lease-bound |
//! | GET | `/v1/kv?prefix=` | Read every key under a prefix |
//! | DELETE | `/v1/kv?key=` | Delete a key |
//! | GET | `/v1/watch?prefix=&timeout_ms=` | Long-poll for key changes |
//! | GET | `/v1/cache?key=` | Read a cache payload (raw bytes) |
//! | PUT | `/v1/cache?key=&ttl_ms=` | Write a cache payload |
//! | DELETE | `/v1/cache?key=` | Delete a cache entry |
//! | GET | `/v1/cache/exists?key=` | Check a cache entry |
//! | POST | `/v1/cache/claim?key=&ttl_ms=` | Set-if-absent |
//! | POST | `/v1/cache/release?key=` | Compare-and-delete |
//! | GET | `/healthz` | Liveness |

pub mod client;
pub mod handlers;
pub mod wire;

use std::time::Duration;

use axum::Router;
use axum::routing::{delete, get, post};
use beacon_state::StateStore;

pub use client::RemoteStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    /// Upper bound on how long one watch poll is held open.
    pub watch_timeout: Duration,
}

/// Build the complete store API router.
pub fn build_router(store: StateStore, watch_timeout: Duration) -> Router {
    let state = ApiState {
        store,
        watch_timeout,
    };

    let api_routes = Router::new()
        .route("/leases", post(handlers::grant_lease))
        .route("/leases/{id}", delete(handlers::revoke_lease))
        .route("/leases/{id}/keepalive", post(handlers::keep_alive))
        .route(
            "/kv",
            get(handlers::list_prefix)
                .put(handlers::put_key)
                .delete(handlers::delete_key),
        )
        .route("/watch", get(handlers::watch))
        .route(
            "/cache",
            get(handlers::cache_get)
                .put(handlers::cache_set)
                .delete(handlers::cache_delete),
        )
        .route("/cache/exists", get(handlers::cache_exists))
        .route("/cache/claim", post(handlers::cache_claim))
        .route("/cache/release", post(handlers::cache_release))
        .with_state(state);

    Router::new()
        .nest("/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
