//! Registry client
//!
//! This library provides:
//! - `RegistryClient`, selecting the lease or catalog backend from configuration
//! - `Resolver` and `LoadBalancer` for turning service keys into addresses
//! - `Watcher` for following membership changes of a service

pub mod balancer;
pub mod client;
pub mod resolver;
pub mod watcher;

pub use balancer::{LoadBalancer, LoadBalancingStrategy};
pub use client::RegistryClient;
pub use resolver::{contains, remove, Resolver};
pub use watcher::{Change, StopHandle, Watcher};

pub use registry_catalog::{CatalogRegistry, MemoryCatalogStore};
pub use registry_core::*;
pub use registry_lease::{LeaseRegistry, LeaseState, MemoryLeaseStore};
