//! Discovery domain types shared by the registrar, the resolver, and
//! their consumers.
//!
//! A registered instance lives under a hierarchical key
//! `{prefix}/{service}/{host}:{port}` whose value is the same
//! `{host}:{port}` string. The resolver reads every key under
//! `{prefix}/{service}/` and turns them into an [`AddressSet`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors produced when parsing a `host:port` string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing port in address `{0}`")]
    MissingPort(String),

    #[error("invalid port in address `{0}`")]
    InvalidPort(String),

    #[error("empty host in address `{0}`")]
    EmptyHost(String),
}

// ── Address ───────────────────────────────────────────────────────

/// A reachable endpoint of one service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServiceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(AddressError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

// ── Service key ───────────────────────────────────────────────────

/// The coordination-store key under which one registered instance lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    prefix: String,
    service: String,
    address: ServiceAddress,
}

impl ServiceKey {
    pub fn new(prefix: &str, service: &str, address: ServiceAddress) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            service: service.trim_matches('/').to_string(),
            address,
        }
    }

    /// The prefix every instance of `service` is registered under.
    ///
    /// Always ends with `/`, so `user` never matches `user-admin`.
    pub fn service_prefix(prefix: &str, service: &str) -> String {
        format!(
            "{}/{}/",
            prefix.trim_end_matches('/'),
            service.trim_matches('/')
        )
    }

    /// Split a raw store key back into prefix, service and address.
    pub fn parse(key: &str) -> Option<Self> {
        let (rest, address) = key.rsplit_once('/')?;
        let (prefix, service) = rest.rsplit_once('/')?;
        if service.is_empty() {
            return None;
        }
        let address = address.parse().ok()?;
        Some(Self::new(prefix, service, address))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            Self::service_prefix(&self.prefix, &self.service),
            self.address
        )
    }
}

// ── Address set ───────────────────────────────────────────────────

/// The resolver's complete view of a service: store key → address.
///
/// Always replaced wholesale; consumers never see partial deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSet {
    entries: BTreeMap<String, ServiceAddress>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from raw `(key, value)` pairs read from the store.
    ///
    /// Values that are not a valid `host:port` are skipped.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut set = Self::new();
        for (key, value) in entries {
            let key = key.into();
            match value.as_ref().parse::<ServiceAddress>() {
                Ok(addr) => {
                    set.entries.insert(key, addr);
                }
                Err(e) => warn!(%key, error = %e, "skipping malformed service address"),
            }
        }
        set
    }

    pub fn insert(&mut self, key: impl Into<String>, address: ServiceAddress) -> Option<ServiceAddress> {
        self.entries.insert(key.into(), address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn contains_address(&self, address: &ServiceAddress) -> bool {
        self.entries.values().any(|a| a == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceAddress)> {
        self.entries.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ServiceAddress> {
        self.entries.values()
    }

    /// `host:port` strings in key order.
    pub fn endpoints(&self) -> Vec<String> {
        self.entries.values().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display() {
        let addr: ServiceAddress = "10.0.0.1:50051".parse().unwrap();
        assert_eq!(addr, ServiceAddress::new("10.0.0.1", 50051));
        assert_eq!(addr.to_string(), "10.0.0.1:50051");
    }

    #[test]
    fn ipv6_address_is_bracketed() {
        let addr: ServiceAddress = "[::1]:8080".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_string(), "[::1]:8080");
    }

    #[test]
    fn address_errors() {
        assert_eq!(
            "10.0.0.1".parse::<ServiceAddress>(),
            Err(AddressError::MissingPort("10.0.0.1".to_string()))
        );
        assert_eq!(
            "10.0.0.1:http".parse::<ServiceAddress>(),
            Err(AddressError::InvalidPort("10.0.0.1:http".to_string()))
        );
        assert_eq!(
            ":80".parse::<ServiceAddress>(),
            Err(AddressError::EmptyHost(":80".to_string()))
        );
    }

    #[test]
    fn service_key_layout() {
        let key = ServiceKey::new("/services/myweb/", "user", ServiceAddress::new("10.0.0.1", 50051));
        assert_eq!(key.to_string(), "/services/myweb/user/10.0.0.1:50051");
        assert_eq!(
            ServiceKey::service_prefix("/services/myweb", "user"),
            "/services/myweb/user/"
        );
    }

    #[test]
    fn service_key_parse() {
        let key = ServiceKey::parse("/svc/user/10.0.0.1:50051").unwrap();
        assert_eq!(key.service(), "user");
        assert_eq!(key.address(), &ServiceAddress::new("10.0.0.1", 50051));
        assert_eq!(key.to_string(), "/svc/user/10.0.0.1:50051");

        assert!(ServiceKey::parse("no-slashes").is_none());
        assert!(ServiceKey::parse("/svc/user/not-an-address").is_none());
    }

    #[test]
    fn address_set_skips_malformed_values() {
        let set = AddressSet::from_entries(vec![
            ("/svc/user/10.0.0.1:1", "10.0.0.1:1"),
            ("/svc/user/bogus", "bogus"),
            ("/svc/user/10.0.0.2:1", "10.0.0.2:1"),
        ]);
        assert_eq!(set.len(), 2);
        assert!(set.contains_key("/svc/user/10.0.0.1:1"));
        assert!(!set.contains_key("/svc/user/bogus"));
        assert_eq!(set.endpoints(), vec!["10.0.0.1:1", "10.0.0.2:1"]);
    }

    #[test]
    fn address_set_equality_ignores_insertion_order() {
        let a = AddressSet::from_entries(vec![("k1", "h1:1"), ("k2", "h2:2")]);
        let b = AddressSet::from_entries(vec![("k2", "h2:2"), ("k1", "h1:1")]);
        assert_eq!(a, b);
        assert!(a.contains_address(&ServiceAddress::new("h2", 2)));
    }
}
