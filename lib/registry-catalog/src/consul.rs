//! Consul agent HTTP client

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::{AgentServiceRegistration, ServiceEntry};
use crate::store::CatalogStore;
use crate::{StoreError, StoreResult};

/// Agent address used when no endpoint is configured
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// HTTP client for one or more Consul agents with failover
#[derive(Clone)]
pub struct ConsulClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
}

impl ConsulClient {
    pub fn new(endpoints: &[String], dial_timeout: Duration) -> StoreResult<Self> {
        let mut endpoints: Vec<String> = endpoints
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(normalize_endpoint)
            .collect();
        if endpoints.is_empty() {
            endpoints.push(normalize_endpoint(DEFAULT_ADDRESS));
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

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> StoreResult<String> {
        let count = self.inner.endpoints.len();
        let start = self.inner.current.load(Ordering::Relaxed);
        let mut last_error = StoreError::Unavailable("no consul agents configured".to_string());

        for offset in 0..count {
            let index = (start + offset) % count;
            let url = endpoint_url(&self.inner.endpoints[index], segments, query)?;
            let mut request = self.inner.http.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    if offset > 0 {
                        self.inner.current.store(index, Ordering::Relaxed);
                        debug!("Switched to consul agent {}", self.inner.endpoints[index]);
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
                    warn!("consul agent {} unavailable: {}", self.inner.endpoints[index], e);
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl CatalogStore for ConsulClient {
    async fn register_service(&self, registration: &AgentServiceRegistration) -> StoreResult<()> {
        self.send(
            Method::PUT,
            &["v1", "agent", "service", "register"],
            &[],
            Some(registration),
        )
        .await?;
        Ok(())
    }

    async fn deregister_service(&self, id: &str) -> StoreResult<()> {
        self.send::<()>(Method::PUT, &["v1", "agent", "service", "deregister", id], &[], None)
            .await?;
        Ok(())
    }

    async fn healthy_instances(&self, name: &str) -> StoreResult<Vec<ServiceEntry>> {
        let text = self
            .send::<()>(
                Method::GET,
                &["v1", "health", "service", name],
                &[("passing", "true")],
                None,
            )
            .await?;
        parse_entries(&text)
    }
}

fn parse_entries(text: &str) -> StoreResult<Vec<ServiceEntry>> {
    // an unknown service comes back as `null` from some agent versions
    let entries: Option<Vec<ServiceEntry>> =
        serde_json::from_str(text).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(entries.unwrap_or_default())
}

/// Build an agent URL. Segments are percent-encoded, so ids and names
/// cannot reshape the path or start a query.
fn endpoint_url(endpoint: &str, segments: &[&str], query: &[(&str, &str)]) -> StoreResult<Url> {
    let mut url =
        Url::parse(endpoint).map_err(|e| StoreError::Unavailable(format!("invalid agent address {}: {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| StoreError::Unavailable(format!("invalid agent address {}", endpoint)))?
        .pop_if_empty()
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}
