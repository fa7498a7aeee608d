//! Polling membership watcher

use futures::stream::{self, Stream};
use registry_core::{Discovery, Result, ServiceDescriptor, ServiceKey};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Membership change of a watched service. Instances are identified by
/// address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Added(ServiceDescriptor),
    Removed(ServiceDescriptor),
}

impl Change {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        match self {
            Change::Added(d) | Change::Removed(d) => d,
        }
    }
}

/// Ends a watcher from another task
#[derive(Clone)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Polls discovery at a fixed interval and reports what changed since the
/// previous poll. The first poll reports every instance as added.
pub struct Watcher<D> {
    discovery: D,
    key: ServiceKey,
    ticker: Interval,
    known: BTreeMap<String, ServiceDescriptor>,
    pending: VecDeque<Change>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<D: Discovery> Watcher<D> {
    pub fn new(discovery: D, key: ServiceKey, interval: Duration) -> Self {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            discovery,
            key,
            ticker,
            known: BTreeMap::new(),
            pending: VecDeque::new(),
            stop_tx,
            stop_rx,
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Instances seen on the last successful poll
    pub fn members(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.known.values()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Next change, a discovery error, or `None` once stopped.
    /// A failed poll leaves the known membership untouched.
    pub async fn next(&mut self) -> Option<Result<Change>> {
        loop {
            if self.is_stopped() {
                return None;
            }
            if let Some(change) = self.pending.pop_front() {
                return Some(Ok(change));
            }

            tokio::select! {
                _ = self.stop_rx.changed() => continue,
                _ = self.ticker.tick() => {}
            }

            match self.discovery.discover(&self.key).await {
                Ok(services) => self.apply(services),
                Err(e) => {
                    warn!("Polling {} failed: {}", self.key, e);
                    return Some(Err(e));
                }
            }
        }
    }

    fn apply(&mut self, services: Vec<ServiceDescriptor>) {
        let mut current: BTreeMap<String, ServiceDescriptor> = services
            .into_iter()
            .map(|s| (s.endpoint.addr.clone(), s))
            .collect();

        for (addr, old) in std::mem::take(&mut self.known) {
            if let Some(service) = current.remove(&addr) {
                self.known.insert(addr, service);
            } else {
                self.pending.push_back(Change::Removed(old));
            }
        }
        for (addr, service) in current {
            self.pending.push_back(Change::Added(service.clone()));
            self.known.insert(addr, service);
        }

        if !self.pending.is_empty() {
            debug!("{} changes for {}", self.pending.len(), self.key);
        }
    }

    /// Adapt the watcher to a `Stream` of changes
    pub fn into_stream(self) -> impl Stream<Item = Result<Change>> {
        stream::unfold(self, |mut watcher| async move {
            watcher.next().await.map(|item| (item, watcher))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use registry_core::RegistryError;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Scripted(Arc<Mutex<Option<Result<Vec<ServiceDescriptor>>>>>);

    impl Scripted {
        fn set(&self, addrs: &[&str]) {
            let services = addrs.iter().map(|a| ServiceDescriptor::new("greeter", *a)).collect();
            *self.0.lock().unwrap() = Some(Ok(services));
        }

        fn fail(&self) {
            *self.0.lock().unwrap() = Some(Err(RegistryError::Connection("refused".to_string())));
        }
    }

    #[async_trait]
    impl Discovery for Scripted {
        async fn discover(&self, _key: &ServiceKey) -> Result<Vec<ServiceDescriptor>> {
            match self.0.lock().unwrap().as_ref() {
                Some(Ok(services)) => Ok(services.clone()),
                Some(Err(_)) => Err(RegistryError::Connection("refused".to_string())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn addr(change: &Change) -> &str {
        change.descriptor().addr()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_additions_and_removals() {
        let source = Scripted::default();
        source.set(&["10.0.0.1:9000", "10.0.0.2:9000"]);
        let mut watcher = Watcher::new(source.clone(), ServiceKey::latest("greeter"), Duration::from_secs(1));

        let first = watcher.next().await.unwrap().unwrap();
        let second = watcher.next().await.unwrap().unwrap();
        assert!(matches!(first, Change::Added(_)));
        assert_eq!(addr(&first), "10.0.0.1:9000");
        assert_eq!(addr(&second), "10.0.0.2:9000");

        source.set(&["10.0.0.2:9000", "10.0.0.3:9000"]);
        let removed = watcher.next().await.unwrap().unwrap();
        let added = watcher.next().await.unwrap().unwrap();
        assert!(matches!(removed, Change::Removed(ref d) if d.addr() == "10.0.0.1:9000"));
        assert!(matches!(added, Change::Added(ref d) if d.addr() == "10.0.0.3:9000"));
        assert_eq!(watcher.members().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_keep_membership() {
        let source = Scripted::default();
        source.set(&["10.0.0.1:9000"]);
        let mut watcher = Watcher::new(source.clone(), ServiceKey::latest("greeter"), Duration::from_secs(1));
        assert!(watcher.next().await.unwrap().is_ok());

        source.fail();
        assert!(matches!(watcher.next().await, Some(Err(RegistryError::Connection(_)))));
        assert_eq!(watcher.members().count(), 1);

        source.set(&[]);
        let change = watcher.next().await.unwrap().unwrap();
        assert!(matches!(change, Change::Removed(ref d) if d.addr() == "10.0.0.1:9000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_stream() {
        let source = Scripted::default();
        source.set(&["10.0.0.1:9000"]);
        let watcher = Watcher::new(source, ServiceKey::latest("greeter"), Duration::from_secs(1));
        let handle = watcher.stop_handle();

        let mut stream = Box::pin(watcher.into_stream());
        assert!(stream.next().await.unwrap().is_ok());

        tokio::spawn(async move {
            time::sleep(Duration::from_secs(5)).await;
            handle.stop();
        });
        // nothing changes, so the stream idles until stopped
        assert!(stream.next().await.is_none());
    }
}
