//! Error types for the Beacon state store.

use thiserror::Error;

use crate::types::LeaseId;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),

    #[error("key {key} is held by live lease {lease}")]
    KeyLeased { key: String, lease: LeaseId },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not supported by this store: {0}")]
    Unsupported(&'static str),
}

impl StateError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            StateError::LeaseNotFound(_)
                | StateError::Invalid(_)
                | StateError::Unsupported(_)
                | StateError::Serialize(_)
                | StateError::Deserialize(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StateError::Unavailable("connection refused".into()).is_transient());
        assert!(StateError::Transaction("busy".into()).is_transient());
        assert!(
            StateError::KeyLeased {
                key: "k".into(),
                lease: LeaseId(7)
            }
            .is_transient()
        );
        assert!(!StateError::LeaseNotFound(LeaseId(7)).is_transient());
        assert!(!StateError::Invalid("ttl".into()).is_transient());
    }
}
