//! Keep-alive state machine for one lease registration
//!
//! The task owns the lease, the keep-alive stream and the published
//! descriptor. Nothing else touches them; callers talk to it through
//! `Command`s and observe it through the `LeaseState` watch channel.

use registry_core::{path, RegistryError, RegistryOptions, Result, ServiceDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::store::{KeepAliveResponse, KeepAliveStream, Lease, LeaseStore};
use crate::StoreError;

pub(crate) const BACKEND: &str = "lease";

/// Lifecycle of a lease registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    Unregistered,
    Registering,
    /// Published and renewing under `lease_id`
    Active { lease_id: i64 },
    /// Lease lost; re-registration is being retried once per TTL
    Degraded,
    Stopping,
}

impl LeaseState {
    pub fn is_active(&self) -> bool {
        matches!(self, LeaseState::Active { .. })
    }
}

pub(crate) enum Command {
    UpdateWeight {
        weight: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A published record and the lease keeping it alive
pub(crate) struct Publication {
    pub lease: Lease,
    pub stream: KeepAliveStream,
}

/// Grant a lease, start renewing it and write the descriptor under it.
/// A lease granted before a failed write is revoked again.
pub(crate) async fn publish<S: LeaseStore>(
    store: &S,
    descriptor: &ServiceDescriptor,
    dial_timeout: Duration,
) -> Result<Publication> {
    let ttl = descriptor.endpoint.ttl as i64;
    let lease = match time::timeout(dial_timeout, store.grant(ttl)).await {
        Ok(Ok(lease)) => lease,
        Ok(Err(e)) => return Err(RegistryError::LeaseGrant(e.to_string())),
        Err(_) => {
            return Err(RegistryError::LeaseGrant(format!(
                "no lease granted within {:?}",
                dial_timeout
            )))
        }
    };

    let stream = match store.keep_alive(lease).await {
        Ok(stream) => stream,
        Err(e) => {
            revoke_quietly(store, lease.id).await;
            return Err(RegistryError::LeaseGrant(e.to_string()));
        }
    };

    if let Err(e) = write_record(store, descriptor, lease.id).await {
        revoke_quietly(store, lease.id).await;
        return Err(e);
    }

    Ok(Publication { lease, stream })
}

pub(crate) async fn write_record<S: LeaseStore>(
    store: &S,
    descriptor: &ServiceDescriptor,
    lease_id: i64,
) -> Result<()> {
    let value = serde_json::to_vec(descriptor).map_err(|e| RegistryError::Write(e.to_string()))?;
    store
        .put(&path::key(descriptor), value, lease_id)
        .await
        .map_err(|e| RegistryError::Write(e.to_string()))
}

async fn revoke_quietly<S: LeaseStore>(store: &S, lease_id: i64) {
    if let Err(e) = store.revoke(lease_id).await {
        debug!("Revoking lease {} failed: {}", lease_id, e);
    }
}

async fn next_renewal(stream: &mut Option<KeepAliveStream>) -> Option<KeepAliveResponse> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) struct KeepAlive<S> {
    store: Arc<S>,
    options: RegistryOptions,
    descriptor: ServiceDescriptor,
    lease: Option<Lease>,
    stream: Option<KeepAliveStream>,
    commands: mpsc::Receiver<Command>,
    state: Arc<watch::Sender<LeaseState>>,
}

impl<S: LeaseStore> KeepAlive<S> {
    pub(crate) fn new(
        store: Arc<S>,
        options: RegistryOptions,
        descriptor: ServiceDescriptor,
        publication: Publication,
        commands: mpsc::Receiver<Command>,
        state: Arc<watch::Sender<LeaseState>>,
    ) -> Self {
        Self {
            store,
            options,
            descriptor,
            lease: Some(publication.lease),
            stream: Some(publication.stream),
            commands,
            state,
        }
    }

    pub(crate) async fn run(mut self) {
        let period = Duration::from_secs(self.descriptor.endpoint.ttl.max(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::UpdateWeight { weight, reply }) => {
                        let _ = reply.send(self.update_weight(weight).await);
                    }
                    Some(Command::Stop { reply }) => {
                        let result = self.teardown().await;
                        let _ = reply.send(result);
                        return;
                    }
                    None => {
                        // registry dropped without unregistering
                        if let Err(e) = self.teardown().await {
                            warn!("Teardown of {} after registry drop failed: {}", self.descriptor.name, e);
                        }
                        return;
                    }
                },
                renewal = next_renewal(&mut self.stream) => match renewal {
                    Some(response) if !response.is_expired() => self.renewed(response),
                    Some(_) => {
                        self.stream = None;
                        self.recover("lease expired").await;
                    }
                    None => {
                        self.stream = None;
                        self.recover("keep-alive stream closed").await;
                    }
                },
                _ = ticker.tick() => {
                    if self.stream.is_none() {
                        self.recover("no keep-alive stream").await;
                    }
                }
            }
        }
    }

    fn renewed(&mut self, response: KeepAliveResponse) {
        self.options
            .record(|m| m.keepalive_renewals_total.with_label_values(&[BACKEND]).inc());
        let state = LeaseState::Active { lease_id: response.id };
        if *self.state.borrow() != state {
            self.state.send_replace(state);
        }
    }

    async fn recover(&mut self, reason: &str) {
        warn!(
            "Registration of {} at {} lost ({}), re-registering",
            self.descriptor.name,
            self.descriptor.addr(),
            reason
        );
        self.state.send_replace(LeaseState::Degraded);
        self.options
            .record(|m| m.keepalive_failures_total.with_label_values(&[BACKEND]).inc());

        let dial_timeout = self.options.dial_timeout_duration();
        match publish(&*self.store, &self.descriptor, dial_timeout).await {
            Ok(publication) => {
                if let Some(old) = self.lease.replace(publication.lease) {
                    // the record is bound to the new lease now
                    revoke_quietly(&*self.store, old.id).await;
                }
                self.stream = Some(publication.stream);
                self.state.send_replace(LeaseState::Active {
                    lease_id: publication.lease.id,
                });
                self.options
                    .record(|m| m.reregistrations_total.with_label_values(&[BACKEND]).inc());
                info!(
                    "Re-registered {} at {} under lease {}",
                    self.descriptor.name,
                    self.descriptor.addr(),
                    publication.lease.id
                );
            }
            Err(e) => {
                self.options
                    .record(|m| m.keepalive_failures_total.with_label_values(&[BACKEND]).inc());
                error!("Re-registration of {} failed: {}", self.descriptor.name, e);
            }
        }
    }

    async fn update_weight(&mut self, weight: i64) -> Result<()> {
        self.descriptor.weight = weight;
        match self.lease {
            Some(lease) if self.stream.is_some() => {
                write_record(&*self.store, &self.descriptor, lease.id).await?;
                debug!("Updated weight of {} to {}", self.descriptor.name, weight);
                Ok(())
            }
            // published with the next successful re-registration
            _ => Ok(()),
        }
    }

    async fn teardown(&mut self) -> Result<()> {
        self.state.send_replace(LeaseState::Stopping);
        self.stream = None;

        let key = path::key(&self.descriptor);
        let mut result = Ok(());
        if let Err(e) = self.store.delete(&key).await {
            error!("Deleting {} failed: {}", key, e);
            result = Err(RegistryError::Deregistration(e.to_string()));
        }
        if let Some(lease) = self.lease.take() {
            match self.store.revoke(lease.id).await {
                Ok(()) => {}
                // already expired, so its keys are gone too
                Err(StoreError::LeaseNotFound(_)) => {
                    debug!("Lease {} expired before teardown", lease.id);
                }
                Err(e) => {
                    error!("Revoking lease {} failed: {}", lease.id, e);
                    if result.is_ok() {
                        result = Err(RegistryError::Deregistration(e.to_string()));
                    }
                }
            }
        }

        self.state.send_replace(LeaseState::Unregistered);
        if result.is_ok() {
            self.options
                .record(|m| m.deregistrations_total.with_label_values(&[BACKEND]).inc());
            info!("Unregistered {} at {}", self.descriptor.name, self.descriptor.addr());
        }
        result
    }
}
