//! Service catalog abstraction

use async_trait::async_trait;

use crate::model::{AgentServiceRegistration, ServiceEntry};
use crate::StoreResult;

/// Operations a health-checking service catalog must offer
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    /// Create or replace the registration with `registration.id`
    async fn register_service(&self, registration: &AgentServiceRegistration) -> StoreResult<()>;

    async fn deregister_service(&self, id: &str) -> StoreResult<()>;

    /// Instances of `name` whose health checks are passing
    async fn healthy_instances(&self, name: &str) -> StoreResult<Vec<ServiceEntry>>;
}
