//! Instance selection strategies

use rand::Rng;
use registry_core::ServiceDescriptor;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    /// Rotate through instances in discovery order
    #[default]
    RoundRobin,
    /// Uniformly random instance
    Random,
    /// Random instance, proportional to its weight
    Weighted,
}

/// Picks one instance out of a discovery result
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    pub fn select<'a>(&self, services: &'a [ServiceDescriptor]) -> Option<&'a ServiceDescriptor> {
        if services.is_empty() {
            return None;
        }

        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let current = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                services.get(current % services.len())
            }
            LoadBalancingStrategy::Random => {
                services.get(rand::thread_rng().gen_range(0..services.len()))
            }
            LoadBalancingStrategy::Weighted => Self::select_weighted(services, &mut rand::thread_rng()),
        }
    }

    fn select_weighted<'a, R: Rng>(services: &'a [ServiceDescriptor], rng: &mut R) -> Option<&'a ServiceDescriptor> {
        let total = services
            .iter()
            .fold(0u64, |total, service| total.saturating_add(effective_weight(service)));
        let mut point = rng.gen_range(0..total);
        for service in services {
            let weight = effective_weight(service);
            if point < weight {
                return Some(service);
            }
            point -= weight;
        }
        services.last()
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default())
    }
}

/// Weights of zero or below count as one
fn effective_weight(service: &ServiceDescriptor) -> u64 {
    service.weight.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn services() -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor::new("greeter", "10.0.0.1:9000").with_weight(1),
            ServiceDescriptor::new("greeter", "10.0.0.2:9000").with_weight(0),
            ServiceDescriptor::new("greeter", "10.0.0.3:9000").with_weight(8),
        ]
    }

    #[test]
    fn test_round_robin() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
        let services = services();
        let picked: Vec<&str> = (0..4).map(|_| lb.select(&services).unwrap().addr()).collect();
        assert_eq!(
            picked,
            vec!["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.3:9000", "10.0.0.1:9000"]
        );
    }

    #[test]
    fn test_empty() {
        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::Random,
            LoadBalancingStrategy::Weighted,
        ] {
            assert!(LoadBalancer::new(strategy).select(&[]).is_none());
        }
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::Random);
        let services = services();
        for _ in 0..50 {
            assert!(lb.select(&services).is_some());
        }
    }

    #[test]
    fn test_weighted_favours_heavy_instances() {
        let services = services();
        let mut rng = StdRng::seed_from_u64(7);
        let mut heavy = 0;
        let mut light_zero = 0;
        for _ in 0..1000 {
            match LoadBalancer::select_weighted(&services, &mut rng).unwrap().addr() {
                "10.0.0.3:9000" => heavy += 1,
                "10.0.0.2:9000" => light_zero += 1,
                _ => {}
            }
        }
        // weights 1, 1 (from 0) and 8 out of 10
        assert!(heavy > 700, "heavy picked {} times", heavy);
        assert!(light_zero > 0);
    }

    #[test]
    fn test_weighted_with_huge_weights() {
        let services: Vec<ServiceDescriptor> = (1..=3)
            .map(|i| ServiceDescriptor::new("greeter", format!("10.0.0.{}:9000", i)).with_weight(i64::MAX))
            .collect();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(LoadBalancer::select_weighted(&services, &mut rng).is_some());
        }
    }
}
