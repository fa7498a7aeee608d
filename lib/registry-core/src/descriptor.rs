//! Service instance descriptors

use crate::{Endpoint, RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_VERSION: &str = "latest";

/// Identity and location of one running service instance.
///
/// This is the value written to the coordination store and returned by
/// discovery. Only `weight` is expected to change after registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default = "ServiceDescriptor::blank")]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub weight: i64,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
    #[serde(flatten)]
    pub endpoint: Endpoint,
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..Self::blank()
        }
    }
}

impl ServiceDescriptor {
    /// Defaults for fields missing from a stored record. The id stays
    /// empty so a record without one reads back the same every time.
    fn blank() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            version: DEFAULT_VERSION.to_string(),
            weight: 0,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            endpoint: Endpoint::default(),
        }
    }
}

impl ServiceDescriptor {
    /// Create a descriptor with a random instance id
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: Endpoint::new(addr),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.endpoint.ttl = ttl;
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tls(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.endpoint.tls = true;
        self.endpoint.cert_file = Some(cert_file.into());
        self.endpoint.key_file = Some(key_file.into());
        self
    }

    pub fn addr(&self) -> &str {
        &self.endpoint.addr
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.name, &self.version)
    }

    /// Checks shared by every backend.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RegistryError::InvalidDescriptor("instance id is empty".to_string()));
        }
        if self.name.is_empty() || self.name.contains('/') {
            return Err(RegistryError::InvalidDescriptor(format!(
                "invalid service name {:?}",
                self.name
            )));
        }
        if self.version.contains('/') {
            return Err(RegistryError::InvalidDescriptor(format!(
                "invalid service version {:?}",
                self.version
            )));
        }
        // the address is the last key segment
        if self.endpoint.addr.is_empty() || self.endpoint.addr.contains('/') {
            return Err(RegistryError::InvalidAddress(self.endpoint.addr.clone()));
        }
        self.endpoint.port()?;
        Ok(())
    }

    /// Lease stores key records by address, so the host must be concrete
    /// and the TTL must be able to hold a lease.
    pub fn validate_for_lease(&self) -> Result<()> {
        self.validate()?;
        if self.endpoint.host().is_empty() {
            return Err(RegistryError::InvalidAddress(self.endpoint.addr.clone()));
        }
        if self.endpoint.ttl == 0 {
            return Err(RegistryError::InvalidDescriptor(
                "ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Name and version of a logical service, without an instance address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Key for the default `latest` version
    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_VERSION)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.version)
        }
    }
}
