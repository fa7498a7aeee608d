//! Address resolution on top of discovery

use registry_core::{Discovery, Result, ServiceDescriptor, ServiceKey};
use tracing::debug;

use crate::balancer::{LoadBalancer, LoadBalancingStrategy};

/// Turns service keys into dialable addresses
pub struct Resolver<D> {
    discovery: D,
    balancer: LoadBalancer,
}

impl<D: Discovery> Resolver<D> {
    pub fn new(discovery: D, strategy: LoadBalancingStrategy) -> Self {
        Self {
            discovery,
            balancer: LoadBalancer::new(strategy),
        }
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// `host:port` of every live instance. Empty when none are available.
    pub async fn resolve(&self, key: &ServiceKey) -> Result<Vec<String>> {
        let services = self.discovery.discover(key).await?;
        debug!("Resolved {} to {} instances", key, services.len());
        Ok(services.into_iter().map(|s| s.endpoint.addr).collect())
    }

    /// One live instance chosen by the configured strategy
    pub async fn pick(&self, key: &ServiceKey) -> Result<Option<ServiceDescriptor>> {
        let services = self.discovery.discover(key).await?;
        Ok(self.balancer.select(&services).cloned())
    }
}

/// Whether `addr` is in `list`
pub fn contains(list: &[String], addr: &str) -> bool {
    list.iter().any(|a| a == addr)
}

/// Remove every occurrence of `addr`, reporting whether anything was removed
pub fn remove(list: &mut Vec<String>, addr: &str) -> bool {
    let before = list.len();
    list.retain(|a| a != addr);
    list.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use registry_core::RegistryError;

    struct Fixed(Vec<ServiceDescriptor>);

    #[async_trait]
    impl Discovery for Fixed {
        async fn discover(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
            if key.name == "broken" {
                return Err(RegistryError::Connection("refused".to_string()));
            }
            Ok(self.0.iter().filter(|s| s.name == key.name).cloned().collect())
        }
    }

    fn resolver() -> Resolver<Fixed> {
        Resolver::new(
            Fixed(vec![
                ServiceDescriptor::new("greeter", "10.0.0.1:9000"),
                ServiceDescriptor::new("greeter", "10.0.0.2:9000"),
            ]),
            LoadBalancingStrategy::RoundRobin,
        )
    }

    #[tokio::test]
    async fn test_resolve() {
        let resolver = resolver();
        let addrs = resolver.resolve(&ServiceKey::latest("greeter")).await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);
        assert!(resolver.resolve(&ServiceKey::latest("billing")).await.unwrap().is_empty());
        assert!(resolver.resolve(&ServiceKey::latest("broken")).await.is_err());
    }

    #[tokio::test]
    async fn test_pick() {
        let resolver = resolver();
        let key = ServiceKey::latest("greeter");
        let first = resolver.pick(&key).await.unwrap().unwrap();
        let second = resolver.pick(&key).await.unwrap().unwrap();
        assert_ne!(first.addr(), second.addr());
        assert!(resolver.pick(&ServiceKey::latest("billing")).await.unwrap().is_none());
    }

    #[test]
    fn test_address_helpers() {
        let mut list = vec!["a:1".to_string(), "b:2".to_string(), "a:1".to_string()];
        assert!(contains(&list, "b:2"));
        assert!(!contains(&list, "c:3"));
        assert!(remove(&mut list, "a:1"));
        assert_eq!(list, vec!["b:2"]);
        assert!(!remove(&mut list, "a:1"));
    }
}
