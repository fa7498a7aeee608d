//! Registry backed by a TTL-lease key/value store

use async_trait::async_trait;
use registry_core::{
    path, Discovery, DiscoveryPolicy, Registry, RegistryError, RegistryOptions, Result, ServiceDescriptor,
    ServiceKey,
};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

use crate::etcd::EtcdClient;
use crate::keepalive::{publish, Command, KeepAlive, LeaseState, BACKEND};
use crate::store::{KeyValue, LeaseStore};

struct Registration {
    descriptor: ServiceDescriptor,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Registers one instance under a lease and keeps the lease alive in a
/// background task until `unregister`.
pub struct LeaseRegistry<S: LeaseStore = EtcdClient> {
    store: Arc<S>,
    options: RegistryOptions,
    registration: Mutex<Option<Registration>>,
    /// Service of the most recent registration, kept after unregister so
    /// discovery keeps working during shutdown.
    service: RwLock<Option<ServiceKey>>,
    state: Arc<watch::Sender<LeaseState>>,
}

impl LeaseRegistry<EtcdClient> {
    /// Create a registry talking to the etcd endpoints in `options`
    pub fn connect(options: RegistryOptions) -> Result<Self> {
        options.config.validate()?;
        let client = EtcdClient::new(&options.config.endpoints, options.dial_timeout_duration())
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        Ok(Self::new(client, options))
    }
}

impl<S: LeaseStore> LeaseRegistry<S> {
    pub fn new(store: S, options: RegistryOptions) -> Self {
        Self::with_store(Arc::new(store), options)
    }

    pub fn with_store(store: Arc<S>, options: RegistryOptions) -> Self {
        let (state, _) = watch::channel(LeaseState::Unregistered);
        Self {
            store,
            options,
            registration: Mutex::new(None),
            service: RwLock::new(None),
            state: Arc::new(state),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current registration state
    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    /// Follow state changes; a long-lived `Degraded` means the store keeps
    /// refusing re-registration.
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Descriptor of the active registration
    pub async fn descriptor(&self) -> Option<ServiceDescriptor> {
        self.registration
            .lock()
            .await
            .as_ref()
            .map(|r| r.descriptor.clone())
    }

    /// Change the published weight without re-registering
    pub async fn update_weight(&self, weight: i64) -> Result<()> {
        let (reply, response) = oneshot::channel();
        {
            let mut slot = self.registration.lock().await;
            let registration = slot.as_mut().ok_or(RegistryError::NotRegistered)?;
            registration
                .commands
                .send(Command::UpdateWeight { weight, reply })
                .await
                .map_err(|_| RegistryError::Internal("keep-alive task is not running".to_string()))?;
            registration.descriptor.weight = weight;
        }
        response
            .await
            .map_err(|_| RegistryError::Internal("keep-alive task dropped the request".to_string()))?
    }

    async fn register_inner(&self, descriptor: ServiceDescriptor) -> Result<()> {
        descriptor.validate_for_lease()?;

        let mut slot = self.registration.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Err(RegistryError::AlreadyRegistered(existing.descriptor.id.clone()));
        }

        self.state.send_replace(LeaseState::Registering);
        let publication = match self.publish(&descriptor).await {
            Ok(publication) => publication,
            Err(e) => {
                self.state.send_replace(LeaseState::Unregistered);
                return Err(e);
            }
        };
        let lease_id = publication.lease.id;

        let (commands, receiver) = mpsc::channel(4);
        let keep_alive = KeepAlive::new(
            self.store.clone(),
            self.options.clone(),
            descriptor.clone(),
            publication,
            receiver,
            self.state.clone(),
        );
        self.state.send_replace(LeaseState::Active { lease_id });
        let task = tokio::spawn(keep_alive.run().with_subscriber(self.options.logger.clone()));

        if let Ok(mut service) = self.service.write() {
            *service = Some(descriptor.key());
        }
        self.options
            .record(|m| m.registrations_total.with_label_values(&[BACKEND]).inc());
        info!(
            "Registered {} ({}) at {} under lease {}",
            descriptor.name, descriptor.id, descriptor.endpoint.addr, lease_id
        );

        *slot = Some(Registration {
            descriptor,
            commands,
            task,
        });
        Ok(())
    }

    async fn publish(&self, descriptor: &ServiceDescriptor) -> Result<crate::keepalive::Publication> {
        let dial_timeout = self.options.dial_timeout_duration();
        match time::timeout(dial_timeout, self.store.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RegistryError::Connection(e.to_string())),
            Err(_) => {
                return Err(RegistryError::Connection(format!(
                    "no store endpoint answered within {:?}",
                    dial_timeout
                )))
            }
        }
        publish(&*self.store, descriptor, dial_timeout).await
    }

    async fn unregister_inner(&self) -> Result<()> {
        // held until teardown finishes so a new registration cannot race it
        let mut slot = self.registration.lock().await;
        let registration = slot.take().ok_or(RegistryError::NotRegistered)?;

        let (reply, ack) = oneshot::channel();
        if registration.commands.send(Command::Stop { reply }).await.is_err() {
            self.state.send_replace(LeaseState::Unregistered);
            return Err(RegistryError::Internal("keep-alive task is not running".to_string()));
        }

        let shutdown_timeout = self.options.shutdown_timeout_duration();
        match time::timeout(shutdown_timeout, ack).await {
            Ok(Ok(result)) => {
                if let Err(e) = registration.task.await {
                    debug!("Keep-alive task ended abnormally: {}", e);
                }
                result
            }
            Ok(Err(_)) => Err(RegistryError::Internal(
                "keep-alive task dropped the stop request".to_string(),
            )),
            Err(_) => {
                warn!(
                    "Keep-alive task for {} did not stop within {:?}, aborting",
                    registration.descriptor.name, shutdown_timeout
                );
                registration.task.abort();
                self.state.send_replace(LeaseState::Unregistered);
                Err(RegistryError::ShutdownTimeout(shutdown_timeout))
            }
        }
    }

    async fn discover_inner(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
        let prefix = path::prefix(key);
        let entries = self.store.get_prefix(&prefix).await.map_err(|e| {
            self.options
                .record(|m| m.discovery_errors_total.with_label_values(&[BACKEND]).inc());
            RegistryError::Connection(e.to_string())
        })?;

        let services = decode_entries(entries, self.options.config.discovery_policy);
        if services.is_err() {
            self.options
                .record(|m| m.discovery_errors_total.with_label_values(&[BACKEND]).inc());
        }
        services
    }

    fn current_service(&self) -> Result<ServiceKey> {
        self.service
            .read()
            .ok()
            .and_then(|service| service.clone())
            .ok_or(RegistryError::NotRegistered)
    }
}

fn decode_entries(entries: Vec<KeyValue>, policy: DiscoveryPolicy) -> Result<Vec<ServiceDescriptor>> {
    let mut services = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_slice::<ServiceDescriptor>(&entry.value) {
            Ok(descriptor) => services.push(descriptor),
            Err(source) => match policy {
                DiscoveryPolicy::Strict => {
                    return Err(RegistryError::Deserialization {
                        key: entry.key,
                        source,
                    })
                }
                DiscoveryPolicy::SkipMalformed => {
                    warn!("Skipping malformed service record at {}: {}", entry.key, source);
                }
            },
        }
    }
    Ok(services)
}

#[async_trait]
impl<S: LeaseStore> Registry for LeaseRegistry<S> {
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        self.options.scoped(self.register_inner(descriptor)).await
    }

    async fn unregister(&self) -> Result<()> {
        self.options.scoped(self.unregister_inner()).await
    }

    async fn get_services(&self) -> Result<Vec<ServiceDescriptor>> {
        let key = self.current_service()?;
        self.options.scoped(self.discover_inner(&key)).await
    }
}

#[async_trait]
impl<S: LeaseStore> Discovery for LeaseRegistry<S> {
    async fn discover(&self, key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
        self.options.scoped(self.discover_inner(key)).await
    }
}
