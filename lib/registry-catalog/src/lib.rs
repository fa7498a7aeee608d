//! Catalog backend
//!
//! Registers a service instance with a Consul-style agent that health
//! checks it over TCP and lists only passing instances.

pub mod consul;
pub mod error;
pub mod memory;
pub mod model;
pub mod registry;
pub mod store;

pub use consul::{ConsulClient, DEFAULT_ADDRESS};
pub use error::{StoreError, StoreResult};
pub use memory::{CatalogStats, MemoryCatalogStore};
pub use model::{AgentService, AgentServiceCheck, AgentServiceRegistration, Node, ServiceEntry, Weights};
pub use registry::CatalogRegistry;
pub use store::CatalogStore;
