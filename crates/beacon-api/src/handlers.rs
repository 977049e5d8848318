//! REST API handlers.
//!
//! Each handler calls into `StateStore` and answers with the
//! [`ApiResponse`] envelope. Cache payloads travel as raw bytes in both
//! directions; everything else is JSON.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{debug, warn};

use beacon_state::{CoordinationStore, LeaseId, StateError};

use crate::ApiState;
use crate::wire::*;

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse::ok(data)).into_response()
}

fn error_response(code: ErrorCode, msg: &str, status: StatusCode) -> Response {
    (status, Json(ApiResponse::<()>::failure(code, msg))).into_response()
}

/// Map a store error onto an HTTP status and error code.
fn store_error(err: StateError) -> Response {
    let code = ErrorCode::of(&err);
    let status = match code {
        ErrorCode::LeaseNotFound | ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::KeyLeased => StatusCode::CONFLICT,
        ErrorCode::Invalid => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => {
            warn!(error = %err, "store request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let mut body = ApiResponse::<()>::failure(code, err.to_string());
    body.lease = match err {
        StateError::LeaseNotFound(id) | StateError::KeyLeased { lease: id, .. } => Some(id),
        _ => None,
    };
    (status, Json(body)).into_response()
}

// ── Leases ─────────────────────────────────────────────────────

/// POST /v1/leases
pub async fn grant_lease(
    State(state): State<ApiState>,
    Json(req): Json<GrantRequest>,
) -> Response {
    match state.store.grant_lease(req.ttl_secs) {
        Ok(lease) => (StatusCode::CREATED, Json(ApiResponse::ok(lease))).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /v1/leases/{id}/keepalive
pub async fn keep_alive(State(state): State<ApiState>, Path(id): Path<u64>) -> Response {
    match state.store.keep_alive_lease(LeaseId(id)) {
        Ok(lease) => ok(lease),
        Err(e) => store_error(e),
    }
}

/// DELETE /v1/leases/{id}
pub async fn revoke_lease(State(state): State<ApiState>, Path(id): Path<u64>) -> Response {
    match state.store.revoke_lease(LeaseId(id)) {
        Ok(existed) => ok(existed),
        Err(e) => store_error(e),
    }
}

// ── Keys ───────────────────────────────────────────────────────

/// PUT /v1/kv
pub async fn put_key(State(state): State<ApiState>, Json(req): Json<PutRequest>) -> Response {
    match state.store.put_key(&req.key, &req.value, req.lease) {
        Ok(()) => ok(true),
        Err(e) => store_error(e),
    }
}

/// GET /v1/kv?prefix=
pub async fn list_prefix(
    State(state): State<ApiState>,
    Query(q): Query<PrefixQuery>,
) -> Response {
    match state.store.list_prefix(&q.prefix) {
        Ok(entries) => ok(entries),
        Err(e) => store_error(e),
    }
}

/// DELETE /v1/kv?key=
pub async fn delete_key(State(state): State<ApiState>, Query(q): Query<KeyQuery>) -> Response {
    match state.store.delete_key(&q.key) {
        Ok(existed) => ok(existed),
        Err(e) => store_error(e),
    }
}

/// GET /v1/watch?prefix=&timeout_ms=
///
/// Long-poll: waits for the first event under `prefix` (or the timeout),
/// then returns it together with anything else already queued. An empty
/// list means nothing changed.
pub async fn watch(State(state): State<ApiState>, Query(q): Query<WatchQuery>) -> Response {
    let wait = q
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.watch_timeout)
        .min(state.watch_timeout);

    let mut rx = match CoordinationStore::watch(&state.store, &q.prefix).await {
        Ok(rx) => rx,
        Err(e) => return store_error(e),
    };

    let mut events = Vec::new();
    if let Ok(Some(first)) = tokio::time::timeout(wait, rx.recv()).await {
        events.push(first);
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
    }
    debug!(prefix = %q.prefix, events = events.len(), "watch poll answered");
    ok(events)
}

// ── Cache ──────────────────────────────────────────────────────

/// GET /v1/cache?key=
pub async fn cache_get(State(state): State<ApiState>, Query(q): Query<KeyQuery>) -> Response {
    match state.store.cache_get(&q.key) {
        Ok(Some(payload)) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            payload,
        )
            .into_response(),
        Ok(None) => error_response(ErrorCode::NotFound, "cache entry not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(e),
    }
}

/// PUT /v1/cache?key=&ttl_ms=
pub async fn cache_set(
    State(state): State<ApiState>,
    Query(q): Query<CacheQuery>,
    body: Bytes,
) -> Response {
    let ttl = q.ttl_ms.map(Duration::from_millis);
    match state.store.cache_set(&q.key, &body, ttl) {
        Ok(()) => ok(true),
        Err(e) => store_error(e),
    }
}

/// DELETE /v1/cache?key=
pub async fn cache_delete(State(state): State<ApiState>, Query(q): Query<KeyQuery>) -> Response {
    match state.store.cache_delete(&q.key) {
        Ok(existed) => ok(existed),
        Err(e) => store_error(e),
    }
}

/// GET /v1/cache/exists?key=
pub async fn cache_exists(State(state): State<ApiState>, Query(q): Query<KeyQuery>) -> Response {
    match state.store.cache_exists(&q.key) {
        Ok(exists) => ok(exists),
        Err(e) => store_error(e),
    }
}

/// POST /v1/cache/claim?key=&ttl_ms=
///
/// Set-if-absent. A TTL is mandatory so a crashed claimant cannot hold
/// the key forever.
pub async fn cache_claim(
    State(state): State<ApiState>,
    Query(q): Query<CacheQuery>,
    body: Bytes,
) -> Response {
    let Some(ttl_ms) = q.ttl_ms.filter(|ms| *ms > 0) else {
        return error_response(
            ErrorCode::Invalid,
            "claim requires a positive ttl_ms",
            StatusCode::BAD_REQUEST,
        );
    };
    match state
        .store
        .cache_set_if_absent(&q.key, &body, Duration::from_millis(ttl_ms))
    {
        Ok(stored) => ok(stored),
        Err(e) => store_error(e),
    }
}

/// POST /v1/cache/release?key=
///
/// Compare-and-delete: the body is the value the caller expects to find.
pub async fn cache_release(
    State(state): State<ApiState>,
    Query(q): Query<KeyQuery>,
    body: Bytes,
) -> Response {
    match state.store.cache_compare_and_delete(&q.key, &body) {
        Ok(deleted) => ok(deleted),
        Err(e) => store_error(e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_state::StateStore;

    fn test_state() -> ApiState {
        ApiState {
            store: StateStore::open_in_memory().unwrap(),
            watch_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn grant_returns_created() {
        let state = test_state();
        let resp = grant_lease(State(state), Json(GrantRequest { ttl_secs: 10 })).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn zero_ttl_grant_is_bad_request() {
        let state = test_state();
        let resp = grant_lease(State(state), Json(GrantRequest { ttl_secs: 0 })).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn keep_alive_unknown_lease_is_not_found() {
        let state = test_state();
        let resp = keep_alive(State(state), Path(99)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn put_on_foreign_lease_conflicts() {
        let state = test_state();
        let a = state.store.grant_lease(10).unwrap();
        let b = state.store.grant_lease(10).unwrap();
        state.store.put_key("/svc/a/h:1", "h:1", Some(a.id)).unwrap();

        let resp = put_key(
            State(state),
            Json(PutRequest {
                key: "/svc/a/h:1".to_string(),
                value: "h:1".to_string(),
                lease: Some(b.id),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn missing_cache_entry_is_not_found() {
        let state = test_state();
        let resp = cache_get(
            State(state),
            Query(KeyQuery {
                key: "user:1".to_string(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn claim_without_ttl_is_rejected() {
        let state = test_state();
        let resp = cache_claim(
            State(state),
            Query(CacheQuery {
                key: "lock:user:1".to_string(),
                ttl_ms: None,
            }),
            Bytes::from_static(b"token"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn idle_watch_returns_empty_list() {
        let state = test_state();
        let resp = watch(
            State(state),
            Query(WatchQuery {
                prefix: "/svc/".to_string(),
                timeout_ms: Some(20),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
