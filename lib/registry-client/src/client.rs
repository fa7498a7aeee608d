//! Backend-agnostic registry handle

use async_trait::async_trait;
use registry_catalog::CatalogRegistry;
use registry_core::{
    BackendKind, Discovery, Registry, RegistryConfig, RegistryOptions, Result, ServiceDescriptor, ServiceKey,
};
use registry_lease::{LeaseRegistry, LeaseState};
use tokio::sync::watch;
use tracing::info;

/// Registry for whichever backend the configuration names
pub enum RegistryClient {
    Lease(LeaseRegistry),
    Catalog(CatalogRegistry),
}

impl RegistryClient {
    /// Build the backend named by `config.backend`. `config` replaces the
    /// configuration carried in `options`.
    pub fn connect(config: RegistryConfig, options: RegistryOptions) -> Result<Self> {
        config.validate()?;
        let backend = config.backend;
        let options = RegistryOptions { config, ..options };

        let client = match backend {
            BackendKind::Lease => RegistryClient::Lease(LeaseRegistry::connect(options)?),
            BackendKind::Catalog => RegistryClient::Catalog(CatalogRegistry::connect(options)?),
        };
        info!("Using {} registry backend", backend.as_str());
        Ok(client)
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            RegistryClient::Lease(_) => BackendKind::Lease,
            RegistryClient::Catalog(_) => BackendKind::Catalog,
        }
    }

    /// Change the published weight of the registered instance
    pub async fn update_weight(&self, weight: i64) -> Result<()> {
        match self {
            RegistryClient::Lease(r) => r.update_weight(weight).await,
            RegistryClient::Catalog(r) => r.update_weight(weight).await,
        }
    }

    /// Lease state changes; `None` for the catalog backend, whose liveness
    /// is tracked by the agent.
    pub fn subscribe(&self) -> Option<watch::Receiver<LeaseState>> {
        match self {
            RegistryClient::Lease(r) => Some(r.subscribe()),
            RegistryClient::Catalog(_) => None,
        }
    }
}

impl From<LeaseRegistry> for RegistryClient {
    fn from(registry: LeaseRegistry) -> Self {
        RegistryClient::Lease(registry)
    }
}

impl From<CatalogRegistry> for RegistryClient {
    fn from(registry: CatalogRegistry) -> Self {
        RegistryClient::Catalog(registry)
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        match self {
            RegistryClient::Lease(r) => r.register(descriptor).await,
            RegistryClient::Catalog(r) => r.register(descriptor).await,
        }
    }

    async fn unregister(&self) -> Result<()> {
        match self {
            RegistryClient::Lease(r) => r.unregister().await,
            RegistryClient::Catalog(r) => r.unregister().await,
        }
    }

    async fn get_services(&self) -> Result<Vec<ServiceDescriptor>> {
        match self {
            RegistryClient::Lease(r) => r.get_services().await,
            RegistryClient::Catalog(r) => r.get_services().await,
        }
    }
}

#[async_trait]
impl Discovery for RegistryClient {
    async fn discover(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
        match self {
            RegistryClient::Lease(r) => r.discover(key).await,
            RegistryClient::Catalog(r) => r.discover(key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::RegistryError;

    #[tokio::test]
    async fn test_connect_selects_backend() {
        let config = RegistryConfig {
            backend: BackendKind::Catalog,
            ..Default::default()
        };
        let client = RegistryClient::connect(config, RegistryOptions::default()).unwrap();
        assert_eq!(client.backend(), BackendKind::Catalog);
        assert!(client.subscribe().is_none());

        let config = RegistryConfig {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            ..Default::default()
        };
        let client = RegistryClient::connect(config, RegistryOptions::default()).unwrap();
        assert_eq!(client.backend(), BackendKind::Lease);
        assert_eq!(*client.subscribe().unwrap().borrow(), LeaseState::Unregistered);
    }

    #[test]
    fn test_lease_backend_requires_endpoints() {
        let result = RegistryClient::connect(RegistryConfig::default(), RegistryOptions::default());
        assert!(matches!(result, Err(RegistryError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_not_registered_through_client() {
        let config = RegistryConfig {
            backend: BackendKind::Catalog,
            ..Default::default()
        };
        let client = RegistryClient::connect(config, RegistryOptions::default()).unwrap();
        assert!(matches!(client.unregister().await, Err(RegistryError::NotRegistered)));
        assert!(matches!(client.update_weight(2).await, Err(RegistryError::NotRegistered)));
    }
}
