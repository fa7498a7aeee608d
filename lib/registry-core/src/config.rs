//! Registry configuration
//!
//! Loaded from YAML and overridable from the environment:
//!
//! ```yaml
//! backend: lease          # or "catalog" (aliases: etcd, consul)
//! endpoints: ["http://127.0.0.1:2379"]
//! dial_timeout: 3
//! shutdown_timeout: 10
//! discovery_policy: strict
//! ```

use crate::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const ENV_BACKEND: &str = "REGISTRY_BACKEND";
pub const ENV_ENDPOINTS: &str = "REGISTRY_ENDPOINTS";
pub const ENV_DIAL_TIMEOUT: &str = "REGISTRY_DIAL_TIMEOUT";

/// Which kind of coordination store backs the registry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// TTL-lease key/value store (etcd v3)
    #[default]
    #[serde(alias = "etcd")]
    Lease,
    /// Health-check-driven service catalog (Consul)
    #[serde(alias = "consul")]
    Catalog,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Lease => "lease",
            BackendKind::Catalog => "catalog",
        }
    }
}

impl FromStr for BackendKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lease" | "etcd" => Ok(BackendKind::Lease),
            "catalog" | "consul" => Ok(BackendKind::Catalog),
            other => Err(RegistryError::InvalidConfiguration(format!(
                "unknown registry backend {:?}",
                other
            ))),
        }
    }
}

/// How discovery treats a stored record that fails to deserialize
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPolicy {
    /// Abort the whole read with a deserialization error
    #[default]
    Strict,
    /// Log and drop the record, returning the rest
    SkipMalformed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: BackendKind,
    /// Coordination store addresses
    pub endpoints: Vec<String>,
    /// Seconds to wait for connects and lease grants
    pub dial_timeout: u64,
    /// Seconds `unregister` waits for the keep-alive task to acknowledge
    pub shutdown_timeout: u64,
    pub discovery_policy: DiscoveryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            endpoints: Vec::new(),
            dial_timeout: 3,
            shutdown_timeout: 10,
            discovery_policy: DiscoveryPolicy::default(),
        }
    }
}

impl RegistryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RegistryError::InvalidConfiguration(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Apply `REGISTRY_*` environment overrides
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.backend = backend.parse()?;
            debug!("Registry backend overridden from environment: {}", self.backend.as_str());
        }
        if let Some(endpoints) = lookup(ENV_ENDPOINTS) {
            self.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
            debug!("Registry endpoints overridden from environment: {:?}", self.endpoints);
        }
        if let Some(timeout) = lookup(ENV_DIAL_TIMEOUT) {
            self.dial_timeout = timeout.trim().parse().map_err(|_| {
                RegistryError::InvalidConfiguration(format!("invalid {}: {:?}", ENV_DIAL_TIMEOUT, timeout))
            })?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::Lease && self.endpoints.is_empty() {
            return Err(RegistryError::InvalidConfiguration(
                "lease backend requires at least one endpoint".to_string(),
            ));
        }
        if self.dial_timeout == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "dial_timeout must be greater than zero".to_string(),
            ));
        }
        if self.shutdown_timeout == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "shutdown_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.backend, BackendKind::Lease);
        assert!(config.endpoints.is_empty());
        assert_eq!(config.dial_timeout(), Duration::from_secs(3));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.discovery_policy, DiscoveryPolicy::Strict);
    }

    #[test]
    fn test_from_yaml() {
        let config = RegistryConfig::from_yaml_str(
            "backend: consul\nendpoints: [\"127.0.0.1:8500\"]\ndiscovery_policy: skip_malformed\n",
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Catalog);
        assert_eq!(config.endpoints, vec!["127.0.0.1:8500"]);
        assert_eq!(config.dial_timeout, 3);
        assert_eq!(config.discovery_policy, DiscoveryPolicy::SkipMalformed);
    }

    #[test]
    fn test_bad_yaml() {
        let err = RegistryConfig::from_yaml_str("backend: zookeeper").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BACKEND, "etcd"),
            (ENV_ENDPOINTS, "http://a:2379, http://b:2379,"),
            (ENV_DIAL_TIMEOUT, "7"),
        ]
        .into_iter()
        .collect();
        let config = RegistryConfig {
            backend: BackendKind::Catalog,
            ..Default::default()
        }
        .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
        .unwrap();
        assert_eq!(config.backend, BackendKind::Lease);
        assert_eq!(config.endpoints, vec!["http://a:2379", "http://b:2379"]);
        assert_eq!(config.dial_timeout, 7);
    }

    #[test]
    fn test_validate() {
        assert!(RegistryConfig::default().validate().is_err());
        let catalog = RegistryConfig {
            backend: BackendKind::Catalog,
            ..Default::default()
        };
        assert!(catalog.validate().is_ok());
        let lease = RegistryConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            ..Default::default()
        };
        assert!(lease.validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let config = RegistryConfig {
            backend: BackendKind::Catalog,
            shutdown_timeout: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfiguration(ref msg) if msg.contains("shutdown_timeout")));

        let config = RegistryConfig {
            backend: BackendKind::Catalog,
            dial_timeout: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
