//! Lease store abstraction

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::StoreResult;

/// Lease granted by the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    /// Granted TTL in seconds
    pub ttl: i64,
}

/// One renewal confirmation from a keep-alive stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: i64,
    /// Remaining TTL in seconds; zero or less means the lease is gone
    pub ttl: i64,
}

impl KeepAliveResponse {
    pub fn is_expired(&self) -> bool {
        self.ttl <= 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Renewal confirmations for one lease. The stream ends when the lease can
/// no longer be kept alive; dropping the receiver stops renewals.
pub type KeepAliveStream = mpsc::Receiver<KeepAliveResponse>;

/// Operations a TTL-lease key/value store must offer
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Verify that at least one store endpoint answers
    async fn connect(&self) -> StoreResult<()>;

    async fn grant(&self, ttl: i64) -> StoreResult<Lease>;

    /// Start renewing `lease` in the background
    async fn keep_alive(&self, lease: Lease) -> StoreResult<KeepAliveStream>;

    /// Revoke a lease, deleting every key bound to it
    async fn revoke(&self, lease_id: i64) -> StoreResult<()>;

    /// Write `value` at `key`, bound to `lease_id`
    async fn put(&self, key: &str, value: Vec<u8>, lease_id: i64) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, in key order
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Renewals go out three times per TTL, never more often than every 500ms
pub fn renewal_interval(ttl: i64) -> Duration {
    let millis = (ttl.max(0) as u64).saturating_mul(1000) / 3;
    Duration::from_millis(millis.max(500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_interval() {
        assert_eq!(renewal_interval(9), Duration::from_secs(3));
        assert_eq!(renewal_interval(5), Duration::from_millis(1666));
        assert_eq!(renewal_interval(1), Duration::from_millis(500));
        assert_eq!(renewal_interval(0), Duration::from_millis(500));
    }

    #[test]
    fn test_expired_response() {
        assert!(KeepAliveResponse { id: 1, ttl: 0 }.is_expired());
        assert!(!KeepAliveResponse { id: 1, ttl: 4 }.is_expired());
    }
}
