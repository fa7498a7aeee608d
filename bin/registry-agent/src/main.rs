use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use registry_client::{Discovery, Registry, RegistryClient, RegistryMetrics, RegistryOptions, ServiceKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Dispatch};
use tracing_subscriber::fmt::init as tracing_init;

mod config;

use config::AgentConfig;

struct AgentState {
    registry: RegistryClient,
    metrics: RegistryMetrics,
    key: ServiceKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting registry-agent...");

    let config = AgentConfig::load()?;
    let metrics = RegistryMetrics::new().context("Failed to create registry metrics")?;
    let options = RegistryOptions::new(config.registry.clone())
        .with_logger(tracing::dispatcher::get_default(Dispatch::clone))
        .with_metrics(metrics.clone());
    let registry = RegistryClient::connect(config.registry.clone(), options)?;
    info!("Registry client initialized ({} backend)", registry.backend().as_str());

    let listener = TcpListener::bind(&config.service.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.service.listen))?;
    let local_addr = listener.local_addr()?;
    info!("HTTP server listening on {}", local_addr);

    let descriptor = config.descriptor(local_addr.port());
    let state = Arc::new(AgentState {
        registry,
        metrics,
        key: descriptor.key(),
    });

    tokio::spawn(accept_connections(listener, state.clone()));

    state.registry.register(descriptor.clone()).await?;
    info!(
        "Registered {} ({}) at {}",
        descriptor.name,
        descriptor.id,
        descriptor.addr()
    );

    let watch = tokio::spawn(log_peers(state.clone(), Duration::from_secs(config.watch_interval)));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down registry-agent...");
    watch.abort();

    if let Err(e) = state.registry.unregister().await {
        error!("Failed to unregister {}: {}", descriptor.id, e);
    }

    Ok(())
}

/// Log the discovered peers of this service once per interval
async fn log_peers(state: Arc<AgentState>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        match state.registry.discover(&state.key).await {
            Ok(services) => {
                info!("Discovered {} instances of {}", services.len(), state.key);
                for service in &services {
                    debug!("  - {} at {} (weight {})", service.id, service.addr(), service.weight);
                }
            }
            Err(e) => {
                error!("Error discovering {}: {}", state.key, e);
            }
        }
    }
}

async fn accept_connections(listener: TcpListener, state: Arc<AgentState>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Error accepting HTTP connection: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AgentState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    if method != Method::GET {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n"));
    }

    let response = match path.as_str() {
        "/healthz" => text(StatusCode::OK, "OK\n"),
        "/metrics" => match state.metrics.gather() {
            Ok(body) => with_content_type(text(StatusCode::OK, body), "text/plain; version=0.0.4"),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        },
        "/services" => match state.registry.discover(&state.key).await {
            Ok(services) => match serde_json::to_vec(&services) {
                Ok(body) => with_content_type(text(StatusCode::OK, body), "application/json"),
                Err(e) => {
                    warn!("Failed to encode services: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
                }
            },
            Err(e) => {
                warn!("Discovery for /services failed: {}", e);
                text(StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e))
            }
        },
        _ => text(StatusCode::NOT_FOUND, "Not Found\n"),
    };

    Ok(response)
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn with_content_type(mut response: Response<Full<Bytes>>, content_type: &'static str) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
