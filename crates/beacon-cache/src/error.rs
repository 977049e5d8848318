//! Cache error types.

use std::time::Duration;

use thiserror::Error;

use beacon_core::ConfigError;
use beacon_state::StateError;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache store could not be reached. Never reported as a miss.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(#[source] StateError),

    /// The store answered but rejected the operation.
    #[error("cache store error: {0}")]
    Store(#[source] StateError),

    /// Another caller held the load lock for longer than the wait deadline.
    #[error("gave up waiting {waited:?} for `{key}` to be loaded")]
    LoadTimeout { key: String, waited: Duration },

    #[error("cache entry `{key}` is corrupt")]
    Corrupt { key: String },

    #[error("failed to encode value for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode cached value: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("loader failed: {0}")]
    Loader(#[source] anyhow::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::StoreUnavailable(_))
    }
}

impl From<StateError> for CacheError {
    fn from(err: StateError) -> Self {
        if err.is_transient() {
            CacheError::StoreUnavailable(err)
        } else {
            CacheError::Store(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_store_errors_are_unavailable() {
        let down = CacheError::from(StateError::Unavailable("connection refused".into()));
        assert!(matches!(down, CacheError::StoreUnavailable(_)));
        assert!(down.is_transient());

        let rejected = CacheError::from(StateError::Invalid("ttl must be positive".into()));
        assert!(matches!(rejected, CacheError::Store(_)));
        assert!(!rejected.is_transient());
    }
}
