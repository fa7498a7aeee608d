//! Registry capability shared by every coordination backend

use crate::{Result, ServiceDescriptor, ServiceKey};
use async_trait::async_trait;
use std::sync::Arc;

/// Publishes one service instance and reads back its peers.
///
/// A registry holds at most one registration. Calling `register` again
/// before `unregister` fails with `AlreadyRegistered`; once `unregister`
/// returns, the instance may be registered again.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish `descriptor`. Returns only after the record is visible in
    /// the store or the attempt has failed.
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<()>;

    /// Withdraw the registered instance and stop any background renewal.
    async fn unregister(&self) -> Result<()>;

    /// Live instances sharing the registered instance's name and version.
    async fn get_services(&self) -> Result<Vec<ServiceDescriptor>>;
}

/// Lookup of live instances for an arbitrary service.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// An empty list means no instances are currently available.
    async fn discover(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>>;
}

#[async_trait]
impl<T: Registry + ?Sized> Registry for Arc<T> {
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        (**self).register(descriptor).await
    }

    async fn unregister(&self) -> Result<()> {
        (**self).unregister().await
    }

    async fn get_services(&self) -> Result<Vec<ServiceDescriptor>> {
        (**self).get_services().await
    }
}

#[async_trait]
impl<T: Discovery + ?Sized> Discovery for Arc<T> {
    async fn discover(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
        (**self).discover(key).await
    }
}
