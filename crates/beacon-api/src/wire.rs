//! JSON bodies and query strings shared by the server handlers and
//! [`RemoteStore`](crate::RemoteStore).

use serde::{Deserialize, Serialize};

use beacon_state::{LeaseId, StateError};

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Lease named by `lease_not_found` and `key_leased` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseId>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            lease: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code),
            lease: None,
        }
    }
}

/// Machine-readable error class carried next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    LeaseNotFound,
    KeyLeased,
    NotFound,
    Invalid,
    Internal,
}

impl ErrorCode {
    /// Classify a store error for the wire.
    pub fn of(err: &StateError) -> Self {
        match err {
            StateError::LeaseNotFound(_) => ErrorCode::LeaseNotFound,
            StateError::KeyLeased { .. } => ErrorCode::KeyLeased,
            StateError::Invalid(_) | StateError::Unsupported(_) => ErrorCode::Invalid,
            _ => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantRequest {
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrefixQuery {
    pub prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatchQuery {
    pub prefix: String,
    /// How long to hold the poll open; capped by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheQuery {
    pub key: String,
    /// Entry TTL; absent means no expiry for plain sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}
