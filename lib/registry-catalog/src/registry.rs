//! Registry backed by a health-checking service catalog

use async_trait::async_trait;
use registry_core::{
    Discovery, Registry, RegistryError, RegistryOptions, Result, ServiceDescriptor, ServiceKey,
};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::consul::ConsulClient;
use crate::model::AgentServiceRegistration;
use crate::store::CatalogStore;
use crate::StoreError;

const BACKEND: &str = "catalog";

/// Registers one instance with a catalog agent. Liveness is left to the
/// agent's TCP health check, so there is no background task.
pub struct CatalogRegistry<S: CatalogStore = ConsulClient> {
    store: Arc<S>,
    options: RegistryOptions,
    registration: Mutex<Option<ServiceDescriptor>>,
    service: RwLock<Option<ServiceKey>>,
}

impl CatalogRegistry<ConsulClient> {
    /// Create a registry for the agents in `options`, falling back to the
    /// local agent when none are configured.
    pub fn connect(options: RegistryOptions) -> Result<Self> {
        let client = ConsulClient::new(&options.config.endpoints, options.dial_timeout_duration())
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        Ok(Self::new(client, options))
    }
}

impl<S: CatalogStore> CatalogRegistry<S> {
    pub fn new(store: S, options: RegistryOptions) -> Self {
        Self::with_store(Arc::new(store), options)
    }

    pub fn with_store(store: Arc<S>, options: RegistryOptions) -> Self {
        Self {
            store,
            options,
            registration: Mutex::new(None),
            service: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn descriptor(&self) -> Option<ServiceDescriptor> {
        self.registration.lock().await.clone()
    }

    /// Re-submit the registration with a new weight
    pub async fn update_weight(&self, weight: i64) -> Result<()> {
        self.options.scoped(self.update_weight_inner(weight)).await
    }

    async fn update_weight_inner(&self, weight: i64) -> Result<()> {
        let mut slot = self.registration.lock().await;
        let current = slot.as_ref().ok_or(RegistryError::NotRegistered)?;
        let updated = current.clone().with_weight(weight);
        self.submit(&updated).await?;
        debug!("Updated weight of {} to {}", updated.name, weight);
        *slot = Some(updated);
        Ok(())
    }

    async fn submit(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let registration = AgentServiceRegistration::from_descriptor(descriptor)?;
        self.store
            .register_service(&registration)
            .await
            .map_err(|e| match e {
                StoreError::Unavailable(msg) => RegistryError::Connection(msg),
                other => RegistryError::Registration(other.to_string()),
            })
    }

    async fn register_inner(&self, descriptor: ServiceDescriptor) -> Result<()> {
        descriptor.validate()?;

        let mut slot = self.registration.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Err(RegistryError::AlreadyRegistered(existing.id.clone()));
        }

        self.submit(&descriptor).await?;

        if let Ok(mut service) = self.service.write() {
            *service = Some(descriptor.key());
        }
        self.options
            .record(|m| m.registrations_total.with_label_values(&[BACKEND]).inc());
        info!(
            "Registered {} ({}) at {}:{} with the catalog",
            descriptor.name,
            descriptor.id,
            descriptor.endpoint.advertise_host(),
            descriptor.endpoint.port()?
        );

        *slot = Some(descriptor);
        Ok(())
    }

    async fn unregister_inner(&self) -> Result<()> {
        let descriptor = self
            .registration
            .lock()
            .await
            .take()
            .ok_or(RegistryError::NotRegistered)?;

        match self.store.deregister_service(&descriptor.id).await {
            Ok(()) => {
                self.options
                    .record(|m| m.deregistrations_total.with_label_values(&[BACKEND]).inc());
                info!("Unregistered {} ({}) from the catalog", descriptor.name, descriptor.id);
                Ok(())
            }
            Err(e) => {
                error!("Deregistering {} failed: {}", descriptor.id, e);
                Err(RegistryError::Deregistration(e.to_string()))
            }
        }
    }

    async fn discover_inner(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
        let entries = self.store.healthy_instances(&key.name).await.map_err(|e| {
            self.options
                .record(|m| m.discovery_errors_total.with_label_values(&[BACKEND]).inc());
            RegistryError::Connection(e.to_string())
        })?;

        Ok(entries
            .into_iter()
            .filter(|entry| key.version.is_empty() || entry.version() == key.version)
            .map(|entry| entry.into_descriptor())
            .collect())
    }

    fn current_service(&self) -> Result<ServiceKey> {
        self.service
            .read()
            .ok()
            .and_then(|service| service.clone())
            .ok_or(RegistryError::NotRegistered)
    }
}

#[async_trait]
impl<S: CatalogStore> Registry for CatalogRegistry<S> {
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        self.options.scoped(self.register_inner(descriptor)).await
    }

    async fn unregister(&self) -> Result<()> {
        self.options.scoped(self.unregister_inner()).await
    }

    async fn get_services(&self) -> Result<Vec<ServiceDescriptor>> {
        let key = self.current_service()?;
        self.options.scoped(self.discover_inner(&key)).await
    }
}

#[async_trait]
impl<S: CatalogStore> Discovery for CatalogRegistry<S> {
    async fn discover(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
        self.options.scoped(self.discover_inner(key)).await
    }
}
