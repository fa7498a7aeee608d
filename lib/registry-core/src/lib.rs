//! Core types for service registration and discovery
//!
//! This library provides:
//! - Service descriptors and their endpoint helpers
//! - The coordination-store key layout
//! - The `Registry` and `Discovery` capabilities implemented by each backend
//! - Shared configuration, options, errors and metrics

pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod options;
pub mod path;
pub mod registry;

pub use config::{BackendKind, DiscoveryPolicy, RegistryConfig};
pub use descriptor::{ServiceDescriptor, ServiceKey, DEFAULT_VERSION};
pub use endpoint::Endpoint;
pub use error::{RegistryError, Result};
pub use metrics::RegistryMetrics;
pub use options::RegistryOptions;
pub use registry::{Discovery, Registry};
