//! In-process service catalog for tests
//!
//! Registrations start out healthy. Health can be flipped per instance and
//! the whole catalog can be made unreachable or made to reject writes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::model::{AgentService, AgentServiceRegistration, Node, ServiceEntry};
use crate::store::CatalogStore;
use crate::{StoreError, StoreResult};

const NODE_NAME: &str = "memory-agent";
const NODE_ADDRESS: &str = "127.0.0.1";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub registers: u64,
    pub deregisters: u64,
    pub queries: u64,
}

#[derive(Default)]
struct CatalogState {
    services: BTreeMap<String, (AgentServiceRegistration, bool)>,
    unreachable: bool,
    rejecting: bool,
    stats: CatalogStats,
}

impl CatalogState {
    fn check(&self) -> StoreResult<()> {
        if self.unreachable {
            Err(StoreError::Unavailable("memory catalog unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryCatalogStore {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CatalogState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn stats(&self) -> CatalogStats {
        self.with_state(|s| s.stats)
    }

    /// Mark an instance passing or critical. Returns false for unknown ids.
    pub fn set_health(&self, id: &str, passing: bool) -> bool {
        self.with_state(|s| match s.services.get_mut(id) {
            Some((_, healthy)) => {
                *healthy = passing;
                true
            }
            None => false,
        })
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with_state(|s| s.unreachable = unreachable);
    }

    /// Answer every write with a 400 until switched back
    pub fn set_rejecting(&self, rejecting: bool) {
        self.with_state(|s| s.rejecting = rejecting);
    }

    pub fn registration(&self, id: &str) -> Option<AgentServiceRegistration> {
        self.with_state(|s| s.services.get(id).map(|(reg, _)| reg.clone()))
    }

    pub fn len(&self) -> usize {
        self.with_state(|s| s.services.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry(registration: &AgentServiceRegistration) -> ServiceEntry {
    ServiceEntry {
        node: Node {
            node: NODE_NAME.to_string(),
            address: NODE_ADDRESS.to_string(),
        },
        service: AgentService {
            id: registration.id.clone(),
            service: registration.name.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: Some(registration.tags.clone()),
            meta: Some(registration.meta.clone()),
            weights: registration.weights,
        },
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn register_service(&self, registration: &AgentServiceRegistration) -> StoreResult<()> {
        self.with_state(|s| {
            s.check()?;
            if s.rejecting {
                return Err(StoreError::Rejected {
                    status: 400,
                    body: "Invalid service registration".to_string(),
                });
            }
            s.stats.registers += 1;
            let healthy = s
                .services
                .get(&registration.id)
                .map(|(_, healthy)| *healthy)
                .unwrap_or(true);
            s.services
                .insert(registration.id.clone(), (registration.clone(), healthy));
            Ok(())
        })
    }

    async fn deregister_service(&self, id: &str) -> StoreResult<()> {
        self.with_state(|s| {
            s.check()?;
            s.stats.deregisters += 1;
            if s.services.remove(id).is_none() {
                return Err(StoreError::Rejected {
                    status: 404,
                    body: format!("Unknown service ID {:?}", id),
                });
            }
            Ok(())
        })
    }

    async fn healthy_instances(&self, name: &str) -> StoreResult<Vec<ServiceEntry>> {
        self.with_state(|s| {
            s.check()?;
            s.stats.queries += 1;
            Ok(s.services
                .values()
                .filter(|(reg, healthy)| *healthy && reg.name == name)
                .map(|(reg, _)| entry(reg))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::ServiceDescriptor;

    fn registration(id: &str, name: &str) -> AgentServiceRegistration {
        let desc = ServiceDescriptor::new(name, "10.0.0.1:9000").with_id(id);
        AgentServiceRegistration::from_descriptor(&desc).unwrap()
    }

    #[tokio::test]
    async fn test_only_passing_instances_listed() {
        let store = MemoryCatalogStore::new();
        store.register_service(&registration("a", "greeter")).await.unwrap();
        store.register_service(&registration("b", "greeter")).await.unwrap();
        store.register_service(&registration("c", "billing")).await.unwrap();
        assert!(store.set_health("b", false));

        let entries = store.healthy_instances("greeter").await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.service.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert!(!store.set_health("missing", true));
    }

    #[tokio::test]
    async fn test_reregistration_keeps_health() {
        let store = MemoryCatalogStore::new();
        store.register_service(&registration("a", "greeter")).await.unwrap();
        store.set_health("a", false);
        store.register_service(&registration("a", "greeter")).await.unwrap();
        assert!(store.healthy_instances("greeter").await.unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_faults() {
        let store = MemoryCatalogStore::new();
        store.set_rejecting(true);
        let err = store.register_service(&registration("a", "greeter")).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 400, .. }));

        store.set_unreachable(true);
        assert!(store.healthy_instances("greeter").await.unwrap_err().is_transport());
        assert!(store.is_empty());
    }
}
