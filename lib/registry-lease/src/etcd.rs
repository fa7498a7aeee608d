//! etcd v3 client over the JSON gateway
//!
//! Talks to `/v3/*` HTTP endpoints. Keys and values travel base64-encoded
//! and 64-bit integers may come back as strings.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

use crate::store::{renewal_interval, KeepAliveResponse, KeepAliveStream, KeyValue, Lease, LeaseStore};
use crate::{StoreError, StoreResult};

/// HTTP client for an etcd cluster with endpoint failover
#[derive(Clone)]
pub struct EtcdClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
}

impl EtcdClient {
    /// Create a client for `endpoints`; `http://` is assumed when no scheme
    /// is given.
    pub fn new(endpoints: &[String], dial_timeout: Duration) -> StoreResult<Self> {
        let endpoints: Vec<String> = endpoints
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(normalize_endpoint)
            .collect();
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no etcd endpoints configured".to_string()));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(dial_timeout + Duration::from_secs(2))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoints,
                current: AtomicUsize::new(0),
            }),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }

    /// Endpoint requests currently go to
    pub fn current_endpoint(&self) -> &str {
        let index = self.inner.current.load(Ordering::Relaxed);
        &self.inner.endpoints[index % self.inner.endpoints.len()]
    }

    async fn post_text<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> StoreResult<String> {
        let count = self.inner.endpoints.len();
        let start = self.inner.current.load(Ordering::Relaxed);
        let mut last_error = StoreError::Unavailable("no etcd endpoints configured".to_string());

        for offset in 0..count {
            let index = (start + offset) % count;
            let url = format!("{}{}", self.inner.endpoints[index], path);
            match self.inner.http.post(&url).json(body).send().await {
                Ok(response) => {
                    if offset > 0 {
                        self.inner.current.store(index, Ordering::Relaxed);
                        debug!("Switched to etcd endpoint {}", self.inner.endpoints[index]);
                    }
                    let status = response.status();
                    let text = response.text().await?;
                    if !status.is_success() {
                        return Err(StoreError::Rejected {
                            status: status.as_u16(),
                            body: text,
                        });
                    }
                    return Ok(text);
                }
                Err(e) => {
                    warn!("etcd endpoint {} unavailable: {}", self.inner.endpoints[index], e);
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }

    async fn call<B: Serialize + ?Sized, R: DeserializeOwned>(&self, path: &str, body: &B) -> StoreResult<R> {
        let text = self.post_text(path, body).await?;
        serde_json::from_str(&text).map_err(|e| StoreError::Decode(format!("{}: {}", path, e)))
    }

    async fn renew(&self, lease_id: i64) -> StoreResult<KeepAliveResponse> {
        let text = self.post_text("/v3/lease/keepalive", &LeaseIdRequest { id: lease_id }).await?;
        parse_keepalive(&text)
    }
}

#[async_trait]
impl LeaseStore for EtcdClient {
    async fn connect(&self) -> StoreResult<()> {
        let _: serde_json::Value = self.call("/v3/maintenance/status", &serde_json::json!({})).await?;
        debug!("Connected to etcd at {}", self.current_endpoint());
        Ok(())
    }

    async fn grant(&self, ttl: i64) -> StoreResult<Lease> {
        let response: GrantResponse = self.call("/v3/lease/grant", &GrantRequest { ttl }).await?;
        if !response.error.is_empty() {
            return Err(StoreError::Rejected {
                status: 200,
                body: response.error,
            });
        }
        if response.id == 0 {
            return Err(StoreError::Decode("lease grant returned no lease id".to_string()));
        }
        Ok(Lease {
            id: response.id,
            ttl: response.ttl,
        })
    }

    async fn keep_alive(&self, lease: Lease) -> StoreResult<KeepAliveStream> {
        let (tx, rx) = mpsc::channel(16);
        let client = self.clone();
        let period = renewal_interval(lease.ttl);
        let budget = Duration::from_secs(lease.ttl.max(1) as u64);

        let renewer = async move {
            let mut deadline = Instant::now() + budget;
            let mut ticker = time::interval(period);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                match client.renew(lease.id).await {
                    Ok(response) => {
                        if tx.send(response).await.is_err() || response.is_expired() {
                            break;
                        }
                        deadline = Instant::now() + Duration::from_secs(response.ttl as u64);
                    }
                    Err(e) => {
                        debug!("Renewal of lease {} failed: {}", lease.id, e);
                        if Instant::now() >= deadline {
                            warn!("Lease {} not renewed within its TTL, closing keep-alive", lease.id);
                            break;
                        }
                    }
                }
            }
        };
        tokio::spawn(renewer.with_current_subscriber());

        Ok(rx)
    }

    async fn revoke(&self, lease_id: i64) -> StoreResult<()> {
        let result: StoreResult<serde_json::Value> =
            self.call("/v3/lease/revoke", &LeaseIdRequest { id: lease_id }).await;
        result.map(|_| ()).map_err(|e| lease_error(e, lease_id))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: i64) -> StoreResult<()> {
        let request = PutRequest {
            key: STANDARD.encode(key),
            value: STANDARD.encode(value),
            lease: lease_id,
        };
        let _: serde_json::Value = self.call("/v3/kv/put", &request).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let request = RangeRequest {
            key: STANDARD.encode(prefix),
            range_end: STANDARD.encode(prefix_range_end(prefix.as_bytes())),
        };
        let response: RangeResponse = self.call("/v3/kv/range", &request).await?;
        response.kvs.into_iter().map(RawKeyValue::decode).collect()
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let request = DeleteRangeRequest {
            key: STANDARD.encode(key),
        };
        let _: serde_json::Value = self.call("/v3/kv/deleterange", &request).await?;
        Ok(())
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // every byte was 0xff: range to the end of the keyspace
    vec![0]
}

fn parse_keepalive(text: &str) -> StoreResult<KeepAliveResponse> {
    // streamed responses arrive as newline-delimited envelopes
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let envelope: KeepAliveEnvelope =
        serde_json::from_str(line).map_err(|e| StoreError::Decode(format!("/v3/lease/keepalive: {}", e)))?;
    if let Some(error) = envelope.error {
        return Err(StoreError::Rejected {
            status: 200,
            body: error.to_string(),
        });
    }
    let result = envelope.result.unwrap_or_default();
    Ok(KeepAliveResponse {
        id: result.id,
        ttl: result.ttl,
    })
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int {
        Num(i64),
        Str(String),
    }

    match Int::deserialize(deserializer)? {
        Int::Num(n) => Ok(n),
        Int::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Serialize)]
struct GrantRequest {
    #[serde(rename = "TTL")]
    ttl: i64,
}

#[derive(Serialize)]
struct LeaseIdRequest {
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    lease: i64,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
}

#[derive(Serialize)]
struct DeleteRangeRequest {
    key: String,
}

#[derive(Deserialize)]
struct GrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct KeepAliveEnvelope {
    result: Option<KeepAliveResult>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct KeepAliveResult {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
}

#[derive(Deserialize)]
struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

impl RawKeyValue {
    fn decode(self) -> StoreResult<KeyValue> {
        let key = STANDARD
            .decode(&self.key)
            .map_err(|e| StoreError::Decode(format!("key: {}", e)))?;
        let value = STANDARD
            .decode(&self.value)
            .map_err(|e| StoreError::Decode(format!("value: {}", e)))?;
        Ok(KeyValue {
            key: String::from_utf8_lossy(&key).into_owned(),
            value,
        })
    }
}

/// The gateway reports an unknown lease as a rejected request
fn lease_error(err: StoreError, lease_id: i64) -> StoreError {
    match err {
        StoreError::Rejected { ref body, .. } if body.contains("lease not found") => {
            StoreError::LeaseNotFound(lease_id)
        }
        other => other,
    }
}
