//! Consul agent API payloads

use registry_core::{Result, ServiceDescriptor, DEFAULT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Meta key carrying the descriptor version
pub const VERSION_META: &str = "version";
pub const CHECK_INTERVAL: &str = "5s";
pub const DEREGISTER_CRITICAL_AFTER: &str = "5s";

/// PUT /v1/agent/service/register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,

    #[serde(rename = "Address")]
    pub address: String,

    #[serde(rename = "Port")]
    pub port: u16,

    #[serde(rename = "Meta", default)]
    pub meta: BTreeMap<String, String>,

    #[serde(rename = "Weights", default)]
    pub weights: Weights,

    #[serde(rename = "Check", default, skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

impl AgentServiceRegistration {
    /// Registration for `descriptor`, advertising a reachable host and
    /// attaching a TCP health check against it.
    pub fn from_descriptor(descriptor: &ServiceDescriptor) -> Result<Self> {
        let address = descriptor.endpoint.advertise_host();
        let port = descriptor.endpoint.port()?;

        let mut meta = descriptor.metadata.clone();
        meta.insert(VERSION_META.to_string(), descriptor.version.clone());

        Ok(Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            tags: descriptor.tags.iter().cloned().collect(),
            check: Some(AgentServiceCheck {
                tcp: Some(format!("{}:{}", address, port)),
                interval: Some(CHECK_INTERVAL.to_string()),
                deregister_critical_service_after: Some(DEREGISTER_CRITICAL_AFTER.to_string()),
            }),
            address,
            port,
            meta,
            weights: Weights::passing(descriptor.weight),
        })
    }
}

/// Load-balancing weights; the agent refuses a passing weight below 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights {
    #[serde(rename = "Passing", default = "default_weight")]
    pub passing: i64,

    #[serde(rename = "Warning", default = "default_weight")]
    pub warning: i64,
}

impl Weights {
    pub fn passing(weight: i64) -> Self {
        Self {
            passing: weight.max(1),
            warning: 1,
        }
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self::passing(1)
    }
}

fn default_weight() -> i64 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentServiceCheck {
    #[serde(rename = "TCP", default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,

    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(
        rename = "DeregisterCriticalServiceAfter",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deregister_critical_service_after: Option<String>,
}

/// One element of GET /v1/health/service/{name}
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "Node")]
    pub node: Node,

    #[serde(rename = "Service")]
    pub service: AgentService,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "Node", default)]
    pub node: String,

    #[serde(rename = "Address", default)]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Service")]
    pub service: String,

    #[serde(rename = "Address", default)]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,

    #[serde(rename = "Tags", default)]
    pub tags: Option<Vec<String>>,

    #[serde(rename = "Meta", default)]
    pub meta: Option<BTreeMap<String, String>>,

    #[serde(rename = "Weights", default)]
    pub weights: Weights,
}

impl ServiceEntry {
    /// Version recorded in the service meta, `latest` when absent
    pub fn version(&self) -> &str {
        self.service
            .meta
            .as_ref()
            .and_then(|meta| meta.get(VERSION_META))
            .map(String::as_str)
            .unwrap_or(DEFAULT_VERSION)
    }

    /// Descriptor for this instance. The service address wins over the node
    /// address when the agent has one.
    pub fn into_descriptor(self) -> ServiceDescriptor {
        let version = self.version().to_string();
        let ServiceEntry { node, service } = self;
        let host = if service.address.is_empty() {
            node.address
        } else {
            service.address
        };

        let mut metadata = service.meta.unwrap_or_default();
        metadata.remove(VERSION_META);

        let mut descriptor = ServiceDescriptor::new(service.service, format!("{}:{}", host, service.port))
            .with_id(service.id)
            .with_version(version)
            .with_weight(service.weights.passing);
        descriptor.tags = service.tags.unwrap_or_default().into_iter().collect();
        descriptor.metadata = metadata;
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_from_descriptor() {
        let desc = ServiceDescriptor::new("greeter", "10.0.0.1:9000")
            .with_id("greeter-1")
            .with_version("v2")
            .with_tag("grpc")
            .with_metadata("zone", "a")
            .with_weight(0);

        let reg = AgentServiceRegistration::from_descriptor(&desc).unwrap();
        assert_eq!(reg.id, "greeter-1");
        assert_eq!(reg.address, "10.0.0.1");
        assert_eq!(reg.port, 9000);
        assert_eq!(reg.tags, vec!["grpc".to_string()]);
        assert_eq!(reg.meta.get("version").map(String::as_str), Some("v2"));
        assert_eq!(reg.meta.get("zone").map(String::as_str), Some("a"));
        assert_eq!(reg.weights.passing, 1);

        let check = reg.check.unwrap();
        assert_eq!(check.tcp.as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(check.interval.as_deref(), Some("5s"));
        assert_eq!(check.deregister_critical_service_after.as_deref(), Some("5s"));
    }

    #[test]
    fn test_registration_wire_format() {
        let desc = ServiceDescriptor::new("greeter", "10.0.0.1:9000").with_id("greeter-1");
        let reg = AgentServiceRegistration::from_descriptor(&desc).unwrap();
        let json = serde_json::to_value(&reg).unwrap();

        assert_eq!(json["ID"], "greeter-1");
        assert_eq!(json["Name"], "greeter");
        assert_eq!(json["Port"], 9000);
        assert_eq!(json["Weights"]["Passing"], 1);
        assert_eq!(json["Check"]["TCP"], "10.0.0.1:9000");
        assert_eq!(json["Check"]["DeregisterCriticalServiceAfter"], "5s");
    }

    #[test]
    fn test_entry_into_descriptor() {
        let json = r#"{
            "Node": {"Node": "agent-1", "Address": "10.0.0.7"},
            "Service": {
                "ID": "greeter-1",
                "Service": "greeter",
                "Address": "",
                "Port": 9000,
                "Tags": ["grpc"],
                "Meta": {"version": "v2", "zone": "a"},
                "Weights": {"Passing": 5, "Warning": 1}
            }
        }"#;
        let entry: ServiceEntry = serde_json::from_str(json).unwrap();
        let desc = entry.into_descriptor();

        assert_eq!(desc.id, "greeter-1");
        assert_eq!(desc.name, "greeter");
        assert_eq!(desc.version, "v2");
        assert_eq!(desc.addr(), "10.0.0.7:9000");
        assert_eq!(desc.weight, 5);
        assert!(desc.tags.contains("grpc"));
        assert_eq!(desc.metadata.len(), 1);
        assert_eq!(desc.metadata.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_entry_without_meta_is_latest() {
        let json = r#"{
            "Node": {"Address": "10.0.0.7"},
            "Service": {"ID": "a", "Service": "greeter", "Address": "10.0.0.8", "Port": 80, "Tags": null, "Meta": null}
        }"#;
        let entry: ServiceEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.version(), "latest");
        let desc = entry.into_descriptor();
        assert_eq!(desc.addr(), "10.0.0.8:80");
        assert_eq!(desc.weight, 1);
    }
}
