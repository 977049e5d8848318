//! beacon.toml configuration parser.
//!
//! Every section is optional; omitted fields fall back to the defaults
//! below. Durations are strings understood by [`parse_duration`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading or validating `beacon.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("{field}: invalid duration `{value}`")]
    InvalidDuration { field: &'static str, value: String },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub store: StoreSection,
    pub registrar: RegistrarSection,
    pub resolver: ResolverSection,
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Address `beacond serve` binds to.
    pub listen: String,
    /// Base URL clients use to reach the store server.
    pub endpoint: String,
    pub data_dir: PathBuf,
    pub sweep_interval: String,
    pub request_timeout: String,
    /// How long one watch long-poll may stay open.
    pub watch_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarSection {
    pub prefix: String,
    pub ttl: String,
    pub retry_base: String,
    pub retry_max: String,
    pub start_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub prefix: String,
    pub poll_interval: String,
    /// Consecutive failed polls before the consumer sees a degraded signal.
    pub failure_ceiling: u32,
    pub backoff_base: String,
    /// Subscribe to store change events in addition to polling.
    pub watch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub lock_prefix: String,
    pub lock_ttl: String,
    pub retry_interval: String,
    pub wait_deadline: String,
    /// Upper bound of the random offset added to fill TTLs.
    pub fill_jitter: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2379".to_string(),
            endpoint: "http://127.0.0.1:2379".to_string(),
            data_dir: PathBuf::from("/var/lib/beacon"),
            sweep_interval: "1s".to_string(),
            request_timeout: "3s".to_string(),
            watch_timeout: "25s".to_string(),
        }
    }
}

impl Default for RegistrarSection {
    fn default() -> Self {
        Self {
            prefix: "/services".to_string(),
            ttl: "10s".to_string(),
            retry_base: "500ms".to_string(),
            retry_max: "5s".to_string(),
            start_attempts: 5,
        }
    }
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            prefix: "/services".to_string(),
            poll_interval: "10s".to_string(),
            failure_ceiling: 3,
            backoff_base: "500ms".to_string(),
            watch: true,
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            lock_prefix: "lock:".to_string(),
            lock_ttl: "3s".to_string(),
            retry_interval: "50ms".to_string(),
            wait_deadline: "3s".to_string(),
            fill_jitter: "0s".to_string(),
        }
    }
}

fn duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

fn non_zero(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let d = duration(field, value)?;
    if d.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(d)
}

impl StoreSection {
    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        non_zero("store.sweep_interval", &self.sweep_interval)
    }

    pub fn request_timeout(&self) -> Result<Duration, ConfigError> {
        non_zero("store.request_timeout", &self.request_timeout)
    }

    pub fn watch_timeout(&self) -> Result<Duration, ConfigError> {
        non_zero("store.watch_timeout", &self.watch_timeout)
    }
}

impl RegistrarSection {
    pub fn ttl(&self) -> Result<Duration, ConfigError> {
        let ttl = duration("registrar.ttl", &self.ttl)?;
        if ttl < Duration::from_secs(1) {
            return Err(ConfigError::Invalid {
                field: "registrar.ttl",
                reason: "leases are granted in whole seconds; use at least 1s".to_string(),
            });
        }
        Ok(ttl)
    }

    pub fn retry_base(&self) -> Result<Duration, ConfigError> {
        non_zero("registrar.retry_base", &self.retry_base)
    }

    pub fn retry_max(&self) -> Result<Duration, ConfigError> {
        non_zero("registrar.retry_max", &self.retry_max)
    }
}

impl ResolverSection {
    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        non_zero("resolver.poll_interval", &self.poll_interval)
    }

    pub fn backoff_base(&self) -> Result<Duration, ConfigError> {
        non_zero("resolver.backoff_base", &self.backoff_base)
    }
}

impl CacheSection {
    pub fn lock_ttl(&self) -> Result<Duration, ConfigError> {
        non_zero("cache.lock_ttl", &self.lock_ttl)
    }

    pub fn retry_interval(&self) -> Result<Duration, ConfigError> {
        non_zero("cache.retry_interval", &self.retry_interval)
    }

    pub fn wait_deadline(&self) -> Result<Duration, ConfigError> {
        duration("cache.wait_deadline", &self.wait_deadline)
    }

    pub fn fill_jitter(&self) -> Result<Duration, ConfigError> {
        duration("cache.fill_jitter", &self.fill_jitter)
    }
}

impl BeaconConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BeaconConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every duration and bound up front so components never see
    /// a half-valid config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.sweep_interval()?;
        self.store.request_timeout()?;
        self.store.watch_timeout()?;

        self.registrar.ttl()?;
        self.registrar.retry_base()?;
        self.registrar.retry_max()?;
        if self.registrar.start_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "registrar.start_attempts",
                reason: "must be at least 1".to_string(),
            });
        }

        self.resolver.poll_interval()?;
        self.resolver.backoff_base()?;
        if self.resolver.failure_ceiling == 0 {
            return Err(ConfigError::Invalid {
                field: "resolver.failure_ceiling",
                reason: "must be at least 1".to_string(),
            });
        }

        self.cache.lock_ttl()?;
        self.cache.retry_interval()?;
        self.cache.wait_deadline()?;
        self.cache.fill_jitter()?;
        Ok(())
    }
}
