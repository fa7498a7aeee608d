//! In-process lease store
//!
//! Behaves like a single-node lease store and exposes hooks to break it:
//! severing keep-alive streams, refusing requests, injecting raw records and
//! slowing every call down. Intended for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time;

use crate::store::{renewal_interval, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseStore};
use crate::{StoreError, StoreResult};

/// Call counters, useful to assert on store traffic
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub connects: u64,
    pub grant_attempts: u64,
    pub grants: u64,
    pub renewals: u64,
    pub puts: u64,
    pub deletes: u64,
    pub revokes: u64,
    pub ranges: u64,
}

#[derive(Default)]
struct MemoryState {
    next_lease: i64,
    leases: HashMap<i64, i64>,
    kv: BTreeMap<String, (Vec<u8>, Option<i64>)>,
    streams: HashMap<i64, mpsc::Sender<KeepAliveResponse>>,
    unreachable: bool,
    latency: Duration,
    stats: StoreStats,
}

impl MemoryState {
    fn check_reachable(&self) -> StoreResult<()> {
        if self.unreachable {
            Err(StoreError::Unavailable("memory store unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn drop_lease(&mut self, lease_id: i64) {
        self.leases.remove(&lease_id);
        self.streams.remove(&lease_id);
        self.kv.retain(|_, (_, lease)| *lease != Some(lease_id));
    }
}

#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    async fn delay(&self) {
        let latency = self.with_state(|s| s.latency);
        if !latency.is_zero() {
            time::sleep(latency).await;
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.with_state(|s| s.stats)
    }

    /// Close every open keep-alive stream, as a dropped connection would.
    /// Leases and records are left in place.
    pub fn sever_keep_alives(&self) -> usize {
        self.with_state(|s| {
            let count = s.streams.len();
            s.streams.clear();
            count
        })
    }

    /// Make every call fail with `Unavailable` until switched back
    pub fn set_unreachable(&self, unreachable: bool) {
        self.with_state(|s| s.unreachable = unreachable);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    /// Store bytes at `key` without a lease, bypassing serialization
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.with_state(|s| {
            s.kv.insert(key.into(), (value.into(), None));
        });
    }

    /// Expire a lease as if its TTL ran out
    pub fn expire_lease(&self, lease_id: i64) {
        self.with_state(|s| s.drop_lease(lease_id));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.with_state(|s| s.kv.contains_key(key))
    }

    pub fn lease_of(&self, key: &str) -> Option<i64> {
        self.with_state(|s| s.kv.get(key).and_then(|(_, lease)| *lease))
    }

    pub fn active_leases(&self) -> usize {
        self.with_state(|s| s.leases.len())
    }

    /// Push one renewal to the lease's stream. Returns false once the
    /// renewer should stop.
    fn renew(&self, lease_id: i64) -> bool {
        self.with_state(|s| {
            if s.unreachable {
                return s.streams.contains_key(&lease_id);
            }
            let Some(ttl) = s.leases.get(&lease_id).copied() else {
                s.streams.remove(&lease_id);
                return false;
            };
            let Some(stream) = s.streams.get(&lease_id) else {
                return false;
            };
            match stream.try_send(KeepAliveResponse { id: lease_id, ttl }) {
                Ok(()) => {
                    s.stats.renewals += 1;
                    true
                }
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => {
                    s.streams.remove(&lease_id);
                    false
                }
            }
        })
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn connect(&self) -> StoreResult<()> {
        self.delay().await;
        self.with_state(|s| {
            s.stats.connects += 1;
            s.check_reachable()
        })
    }

    async fn grant(&self, ttl: i64) -> StoreResult<Lease> {
        self.delay().await;
        self.with_state(|s| {
            s.stats.grant_attempts += 1;
            s.check_reachable()?;
            s.next_lease += 1;
            let id = s.next_lease;
            s.leases.insert(id, ttl);
            s.stats.grants += 1;
            Ok(Lease { id, ttl })
        })
    }

    async fn keep_alive(&self, lease: Lease) -> StoreResult<KeepAliveStream> {
        self.delay().await;
        let rx = self.with_state(|s| {
            s.check_reachable()?;
            if !s.leases.contains_key(&lease.id) {
                return Err(StoreError::LeaseNotFound(lease.id));
            }
            let (tx, rx) = mpsc::channel(16);
            s.streams.insert(lease.id, tx);
            Ok(rx)
        })?;

        // the renewer never holds a sender, so clearing `streams` closes the stream
        let store = self.clone();
        let period = renewal_interval(lease.ttl);
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            loop {
                ticker.tick().await;
                if !store.renew(lease.id) {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease_id: i64) -> StoreResult<()> {
        self.delay().await;
        self.with_state(|s| {
            s.check_reachable()?;
            s.stats.revokes += 1;
            if !s.leases.contains_key(&lease_id) {
                return Err(StoreError::LeaseNotFound(lease_id));
            }
            s.drop_lease(lease_id);
            Ok(())
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: i64) -> StoreResult<()> {
        self.delay().await;
        self.with_state(|s| {
            s.check_reachable()?;
            if !s.leases.contains_key(&lease_id) {
                return Err(StoreError::LeaseNotFound(lease_id));
            }
            s.kv.insert(key.to_string(), (value, Some(lease_id)));
            s.stats.puts += 1;
            Ok(())
        })
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        self.delay().await;
        self.with_state(|s| {
            s.check_reachable()?;
            s.stats.ranges += 1;
            Ok(s.kv
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, (value, _))| KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect())
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.delay().await;
        self.with_state(|s| {
            s.check_reachable()?;
            s.kv.remove(key);
            s.stats.deletes += 1;
            Ok(())
        })
    }
}
