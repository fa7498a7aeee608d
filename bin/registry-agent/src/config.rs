//! Agent configuration

use anyhow::{Context, Result};
use registry_core::{Endpoint, RegistryConfig, ServiceDescriptor, DEFAULT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Environment variable naming the YAML configuration file
pub const ENV_CONFIG: &str = "REGISTRY_AGENT_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub registry: RegistryConfig,
    pub service: ServiceConfig,
    /// Seconds between peer discovery logs
    pub watch_interval: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            service: ServiceConfig::default(),
            watch_interval: 30,
        }
    }
}

/// The instance this agent announces
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    /// Instance id; a random UUID when unset
    pub id: Option<String>,
    /// Address the HTTP server binds
    pub listen: String,
    /// Address published to the registry; derived from `listen` when unset
    pub advertise: Option<String>,
    pub ttl: u64,
    pub weight: i64,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "registry-agent".to_string(),
            version: DEFAULT_VERSION.to_string(),
            id: None,
            listen: "0.0.0.0:8080".to_string(),
            advertise: None,
            ttl: registry_core::endpoint::DEFAULT_TTL,
            weight: 1,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load from the file named by `REGISTRY_AGENT_CONFIG` when set, then
    /// apply `REGISTRY_*` overrides.
    pub fn load() -> Result<Self> {
        let config = match std::env::var(ENV_CONFIG) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.with_env()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agent config {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid agent config")
    }

    fn with_env(mut self) -> Result<Self> {
        self.registry = self.registry.apply_env()?;
        if self.watch_interval == 0 {
            anyhow::bail!("watch_interval must be greater than zero");
        }
        Ok(self)
    }

    /// Descriptor announced for this agent. A wildcard listen host is
    /// replaced with a local interface address.
    pub fn descriptor(&self, port: u16) -> ServiceDescriptor {
        let addr = match &self.service.advertise {
            Some(addr) => addr.clone(),
            None => format!("{}:{}", Endpoint::new(self.service.listen.as_str()).advertise_host(), port),
        };

        let mut descriptor = ServiceDescriptor::new(self.service.name.as_str(), addr)
            .with_version(self.service.version.as_str())
            .with_ttl(self.service.ttl)
            .with_weight(self.service.weight);
        if let Some(id) = &self.service.id {
            descriptor = descriptor.with_id(id.as_str());
        }
        descriptor.tags = self.service.tags.iter().cloned().collect();
        descriptor.metadata = self.service.metadata.clone();
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::BackendKind;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.service.name, "registry-agent");
        assert_eq!(config.service.listen, "0.0.0.0:8080");
        assert_eq!(config.watch_interval, 30);
        assert_eq!(config.registry.backend, BackendKind::Lease);
    }

    #[test]
    fn test_parse() {
        let yaml = r#"
registry:
  backend: consul
  endpoints: ["127.0.0.1:8500"]
service:
  name: greeter
  version: v2
  id: greeter-1
  listen: 127.0.0.1:9000
  ttl: 5
  tags: [grpc]
  metadata:
    zone: a
watch_interval: 10
"#;
        let config = AgentConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.registry.backend, BackendKind::Catalog);
        assert_eq!(config.watch_interval, 10);

        let desc = config.descriptor(9000);
        assert_eq!(desc.id, "greeter-1");
        assert_eq!(desc.addr(), "127.0.0.1:9000");
        assert_eq!(desc.version, "v2");
        assert_eq!(desc.endpoint.ttl, 5);
        assert!(desc.tags.contains("grpc"));
        assert_eq!(desc.metadata.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_advertise_overrides_listen() {
        let mut config = AgentConfig::default();
        config.service.advertise = Some("10.1.2.3:8080".to_string());
        assert_eq!(config.descriptor(8080).addr(), "10.1.2.3:8080");

        config.service.advertise = None;
        let desc = config.descriptor(8081);
        assert!(desc.addr().ends_with(":8081"));
        assert!(!desc.id.is_empty());
    }
}
