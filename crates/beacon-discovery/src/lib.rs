//! beacon-discovery: register service instances and resolve them.
//!
//! - [`Registrar`] publishes `{prefix}/{service}/{host}:{port}` under a
//!   lease and keeps the lease alive in a background task.
//! - [`Resolver`] polls (and optionally watches) a service prefix and
//!   publishes complete [`AddressSet`](beacon_core::AddressSet)s through
//!   an [`AddressStream`].
//! - [`Balancer`] follows an `AddressStream` and hands out addresses
//!   round-robin.
//!
//! Both background components work against any
//! [`CoordinationStore`](beacon_state::CoordinationStore): the embedded
//! `StateStore` or a `RemoteStore` talking to `beacond serve`.

pub mod backoff;
pub mod balancer;
pub mod error;
pub mod registrar;
pub mod resolver;

pub use backoff::Backoff;
pub use balancer::Balancer;
pub use error::DiscoveryError;
pub use registrar::{Registrar, RegistrarConfig, RegistrarHandle};
pub use resolver::{AddressStream, Resolution, Resolver, ResolverConfig, ResolverHandle};

#[cfg(test)]
pub(crate) mod testing;
