//! Runtime collaborators handed to a registry at construction

use std::future::Future;
use std::time::Duration;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::Dispatch;

use crate::{BackendKind, DiscoveryPolicy, RegistryConfig, RegistryMetrics};

/// Configuration plus the logger and metrics sinks a registry reports to.
///
/// The logger defaults to a no-op dispatcher; pass
/// `tracing::dispatcher::get_default(Dispatch::clone)` to log through the
/// process subscriber.
#[derive(Clone)]
pub struct RegistryOptions {
    pub config: RegistryConfig,
    pub logger: Dispatch,
    pub metrics: Option<RegistryMetrics>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl RegistryOptions {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            logger: Dispatch::none(),
            metrics: None,
        }
    }

    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    /// Dial timeout in seconds
    pub fn dial_timeout(mut self, secs: u64) -> Self {
        self.config.dial_timeout = secs;
        self
    }

    /// Unregister acknowledgement timeout in seconds
    pub fn shutdown_timeout(mut self, secs: u64) -> Self {
        self.config.shutdown_timeout = secs;
        self
    }

    pub fn with_discovery_policy(mut self, policy: DiscoveryPolicy) -> Self {
        self.config.discovery_policy = policy;
        self
    }

    pub fn with_logger(mut self, logger: Dispatch) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: RegistryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dial_timeout_duration(&self) -> Duration {
        self.config.dial_timeout()
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        self.config.shutdown_timeout()
    }

    /// Run `fut` with this registry's logger as the default subscriber
    pub fn scoped<F: Future>(&self, fut: F) -> WithDispatch<F> {
        fut.with_subscriber(self.logger.clone())
    }

    /// Update metrics when a collector is attached
    pub fn record(&self, f: impl FnOnce(&RegistryMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let options = RegistryOptions::default()
            .with_endpoints(["http://127.0.0.1:2379"])
            .dial_timeout(5)
            .shutdown_timeout(2)
            .with_discovery_policy(DiscoveryPolicy::SkipMalformed);
        assert_eq!(options.config.endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(options.dial_timeout_duration(), Duration::from_secs(5));
        assert_eq!(options.shutdown_timeout_duration(), Duration::from_secs(2));
        assert_eq!(options.config.discovery_policy, DiscoveryPolicy::SkipMalformed);
        assert!(options.metrics.is_none());
    }

    #[test]
    fn test_record_without_metrics_is_noop() {
        let options = RegistryOptions::default();
        let mut called = false;
        options.record(|_| called = true);
        assert!(!called);
    }

    #[tokio::test]
    async fn test_scoped_future_runs() {
        let options = RegistryOptions::default();
        let value = options.scoped(async { 42 }).await;
        assert_eq!(value, 42);
    }
}
