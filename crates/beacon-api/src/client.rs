//! RemoteStore: the store traits over HTTP.
//!
//! Every call is a single HTTP/1.1 exchange bounded by the request
//! timeout. Transport failures, timeouts and server-side faults surface
//! as `StateError::Unavailable` so callers treat them as transient;
//! `lease_not_found` and `key_leased` answers map back to their typed
//! variants.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio::sync::mpsc;
use tracing::debug;

use beacon_state::backend::WATCH_BUFFER;
use beacon_state::{
    CacheStore, CoordinationStore, KeyValue, Lease, LeaseId, StateError, StateResult, WatchEvent,
};

use crate::wire::*;

const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";

/// Bounds of the pause between failed watch polls.
const WATCH_RETRY_MIN: Duration = Duration::from_millis(250);
const WATCH_RETRY_MAX: Duration = Duration::from_secs(5);

/// Client for a `beacond serve` endpoint.
#[derive(Clone)]
pub struct RemoteStore {
    client: Client<HttpConnector, Full<Bytes>>,
    base: Arc<str>,
    request_timeout: Duration,
    watch_timeout: Duration,
}

impl RemoteStore {
    /// `endpoint` is a base URL such as `http://127.0.0.1:2379`.
    pub fn new(endpoint: &str, request_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            base: Arc::from(endpoint.trim_end_matches('/')),
            request_timeout,
            watch_timeout: Duration::from_secs(25),
        }
    }

    /// How long each watch long-poll may stay open on the server.
    pub fn with_watch_timeout(mut self, watch_timeout: Duration) -> Self {
        self.watch_timeout = watch_timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.base
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        content_type: &'static str,
        timeout: Duration,
    ) -> StateResult<(StatusCode, Bytes)> {
        let uri = format!("{}{}", self.base, path);
        let req = Request::builder()
            .method(method)
            .uri(&uri)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::USER_AGENT, "beacon/0.1")
            .body(Full::new(body))
            .map_err(|e| StateError::Invalid(format!("{uri}: {e}")))?;

        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| StateError::Unavailable(format!("{uri}: {e}")))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| StateError::Unavailable(format!("{uri}: {e}")))?
                .to_bytes();
            Ok((status, body))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(StateError::Unavailable(format!(
                "{uri}: no response within {timeout:?}"
            ))),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        content_type: &'static str,
        subject: &str,
    ) -> StateResult<T> {
        let (status, body) = self
            .exchange(method, path, body, content_type, self.request_timeout)
            .await?;
        decode(status, &body, subject)
    }

    async fn call_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        req: &B,
        subject: &str,
    ) -> StateResult<T> {
        let body = serde_json::to_vec(req).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.call(method, path, Bytes::from(body), JSON, subject)
            .await
    }

    async fn poll_watch(&self, prefix: &str) -> StateResult<Vec<WatchEvent>> {
        let path = with_query(
            "/v1/watch",
            &WatchQuery {
                prefix: prefix.to_string(),
                timeout_ms: Some(self.watch_timeout.as_millis() as u64),
            },
        )?;
        let (status, body) = self
            .exchange(
                Method::GET,
                &path,
                Bytes::new(),
                JSON,
                self.watch_timeout + self.request_timeout,
            )
            .await?;
        decode(status, &body, prefix)
    }
}

fn with_query<Q: Serialize>(path: &str, query: &Q) -> StateResult<String> {
    let qs = serde_urlencoded::to_string(query).map_err(|e| StateError::Serialize(e.to_string()))?;
    Ok(format!("{path}?{qs}"))
}

/// Unwrap a successful envelope or translate a failed one.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8], subject: &str) -> StateResult<T> {
    if !status.is_success() {
        return Err(failure(status, body, subject));
    }
    let envelope: ApiResponse<T> =
        serde_json::from_slice(body).map_err(|e| StateError::Deserialize(e.to_string()))?;
    if !envelope.success {
        return Err(failure(status, body, subject));
    }
    envelope
        .data
        .ok_or_else(|| StateError::Deserialize("response carried no data".to_string()))
}

fn failure(status: StatusCode, body: &[u8], subject: &str) -> StateError {
    let Ok(envelope) = serde_json::from_slice::<ApiResponse<IgnoredAny>>(body) else {
        return StateError::Unavailable(format!("unexpected HTTP {status}"));
    };
    let message = envelope
        .error
        .unwrap_or_else(|| format!("HTTP {status}"));
    match (envelope.code, envelope.lease) {
        (Some(ErrorCode::LeaseNotFound), Some(lease)) => StateError::LeaseNotFound(lease),
        (Some(ErrorCode::KeyLeased), Some(lease)) => StateError::KeyLeased {
            key: subject.to_string(),
            lease,
        },
        (Some(ErrorCode::Invalid), _) => StateError::Invalid(message),
        _ => StateError::Unavailable(message),
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn grant(&self, ttl_secs: u64) -> StateResult<Lease> {
        self.call_json(Method::POST, "/v1/leases", &GrantRequest { ttl_secs }, "")
            .await
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StateResult<()> {
        let req = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
            lease,
        };
        let _: bool = self.call_json(Method::PUT, "/v1/kv", &req, key).await?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> StateResult<Lease> {
        let path = format!("/v1/leases/{lease}/keepalive");
        self.call(Method::POST, &path, Bytes::new(), JSON, "").await
    }

    async fn revoke(&self, lease: LeaseId) -> StateResult<bool> {
        let path = format!("/v1/leases/{lease}");
        self.call(Method::DELETE, &path, Bytes::new(), JSON, "")
            .await
    }

    async fn get_prefix(&self, prefix: &str) -> StateResult<Vec<KeyValue>> {
        let path = with_query(
            "/v1/kv",
            &PrefixQuery {
                prefix: prefix.to_string(),
            },
        )?;
        self.call(Method::GET, &path, Bytes::new(), JSON, prefix)
            .await
    }

    async fn delete_key(&self, key: &str) -> StateResult<bool> {
        let path = with_query("/v1/kv", &KeyQuery { key: key.to_string() })?;
        self.call(Method::DELETE, &path, Bytes::new(), JSON, key)
            .await
    }

    /// Long-polls `/v1/watch` in a background task. Events that land
    /// between two polls may be missed, so consumers should still poll
    /// the full prefix periodically.
    async fn watch(&self, prefix: &str) -> StateResult<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let store = self.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut retry = WATCH_RETRY_MIN;
            loop {
                let polled = tokio::select! {
                    polled = store.poll_watch(&prefix) => polled,
                    _ = tx.closed() => break,
                };
                match polled {
                    Ok(events) => {
                        retry = WATCH_RETRY_MIN;
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%prefix, error = %e, ?retry, "watch poll failed");
                        tokio::select! {
                            _ = tokio::time::sleep(retry) => {}
                            _ = tx.closed() => break,
                        }
                        retry = (retry * 2).min(WATCH_RETRY_MAX);
                    }
                }
            }
            debug!(%prefix, "remote watch ended");
        });

        Ok(rx)
    }
}

#[async_trait]
impl CacheStore for RemoteStore {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let path = with_query("/v1/cache", &KeyQuery { key: key.to_string() })?;
        let (status, body) = self
            .exchange(Method::GET, &path, Bytes::new(), JSON, self.request_timeout)
            .await?;
        match status {
            s if s.is_success() => Ok(Some(body.to_vec())),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(failure(s, &body, key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
        let path = with_query(
            "/v1/cache",
            &CacheQuery {
                key: key.to_string(),
                ttl_ms: ttl.map(|ttl| ttl.as_millis() as u64),
            },
        )?;
        let _: bool = self
            .call(
                Method::PUT,
                &path,
                Bytes::copy_from_slice(value),
                OCTET_STREAM,
                key,
            )
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StateResult<bool> {
        let path = with_query(
            "/v1/cache/claim",
            &CacheQuery {
                key: key.to_string(),
                ttl_ms: Some(ttl.as_millis().max(1) as u64),
            },
        )?;
        self.call(
            Method::POST,
            &path,
            Bytes::copy_from_slice(value),
            OCTET_STREAM,
            key,
        )
        .await
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        let path = with_query("/v1/cache", &KeyQuery { key: key.to_string() })?;
        self.call(Method::DELETE, &path, Bytes::new(), JSON, key)
            .await
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        let path = with_query("/v1/cache/exists", &KeyQuery { key: key.to_string() })?;
        self.call(Method::GET, &path, Bytes::new(), JSON, key).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StateResult<bool> {
        let path = with_query("/v1/cache/release", &KeyQuery { key: key.to_string() })?;
        self.call(
            Method::POST,
            &path,
            Bytes::copy_from_slice(expected),
            OCTET_STREAM,
            key,
        )
        .await
    }
}
