//! Discovery error types.

use thiserror::Error;

use beacon_core::{AddressError, AddressSet, ConfigError};
use beacon_state::{LeaseId, StateError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The coordination store could not be reached (after retries, where
    /// the operation retries).
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(#[source] StateError),

    /// The store no longer knows the lease; the registrar re-grants.
    #[error("lease {0} expired")]
    LeaseExpired(LeaseId),

    /// Another live lease still holds the key, e.g. the previous run of a
    /// restarted instance.
    #[error("`{key}` is held by lease {holder}")]
    AddressTaken { key: String, holder: LeaseId },

    /// The resolver has failed `failures` polls in a row for at least one
    /// poll interval. `last_known` is the most recent good set.
    #[error("resolving `{service}` failed {failures} times in a row")]
    ResolveTimeout {
        service: String,
        failures: u32,
        last_known: AddressSet,
    },

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DiscoveryError {
    /// Classify a store failure seen while working with `lease`.
    pub(crate) fn from_store(err: StateError, lease: LeaseId) -> Self {
        match err {
            StateError::LeaseNotFound(_) => DiscoveryError::LeaseExpired(lease),
            StateError::KeyLeased { key, lease: holder } => DiscoveryError::AddressTaken { key, holder },
            other => DiscoveryError::StoreUnavailable(other),
        }
    }
}
