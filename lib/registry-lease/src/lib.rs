//! Lease backend
//!
//! Registers a service instance under a TTL lease in an etcd-style key/value
//! store and keeps the lease alive from a background task. A lost lease is
//! re-granted and the record rewritten without caller involvement.

pub mod error;
pub mod etcd;
pub mod keepalive;
pub mod memory;
pub mod registry;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use etcd::EtcdClient;
pub use keepalive::LeaseState;
pub use memory::{MemoryLeaseStore, StoreStats};
pub use registry::LeaseRegistry;
pub use store::{renewal_interval, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseStore};
