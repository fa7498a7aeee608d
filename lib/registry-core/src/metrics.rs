//! Prometheus metrics for registration and discovery

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::{RegistryError, Result};

/// Counters shared by every backend, labelled by backend name
#[derive(Clone)]
pub struct RegistryMetrics {
    /// Successful initial registrations
    pub registrations_total: IntCounterVec,
    /// Registrations re-established by the keep-alive loop
    pub reregistrations_total: IntCounterVec,
    /// Lease renewals confirmed by the store
    pub keepalive_renewals_total: IntCounterVec,
    /// Lost renewal streams and failed recovery attempts
    pub keepalive_failures_total: IntCounterVec,
    /// Completed deregistrations
    pub deregistrations_total: IntCounterVec,
    /// Failed discovery reads
    pub discovery_errors_total: IntCounterVec,
    pub registry: Arc<Registry>,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self> {
        Self::build().map_err(|e| RegistryError::Internal(e.to_string()))
    }

    fn build() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &["backend"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            registrations_total: counter("registry_registrations_total", "Successful service registrations")?,
            reregistrations_total: counter(
                "registry_reregistrations_total",
                "Registrations re-established after lease loss",
            )?,
            keepalive_renewals_total: counter("registry_keepalive_renewals_total", "Confirmed lease renewals")?,
            keepalive_failures_total: counter(
                "registry_keepalive_failures_total",
                "Lost keep-alive streams and failed recovery attempts",
            )?,
            deregistrations_total: counter("registry_deregistrations_total", "Completed deregistrations")?,
            discovery_errors_total: counter("registry_discovery_errors_total", "Failed discovery reads")?,
            registry: registry.clone(),
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| RegistryError::Internal(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| RegistryError::Internal(e.to_string()))
    }
}
