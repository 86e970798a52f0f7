//! Probe, metrics and admission endpoints
//!
//! - `/healthz` liveness
//! - `/readyz` readiness, 503 until the controller is initialized and again during shutdown
//! - `/metrics` Prometheus text format
//! - `/validate` DeployFlow admission webhook

use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Time in-flight admission calls get to finish once shutdown starts
const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Readiness flag flipped by `main`
#[derive(Debug, Clone)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Fail the readiness probe so the pod is taken out of rotation
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ServerState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

impl ServerState {
    pub fn new(readiness: ReadinessState, metrics: SharedMetrics) -> Self {
        Self { readiness, metrics }
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub fn build_router(readiness: ReadinessState, metrics: SharedMetrics) -> Router {
    let state = ServerState::new(readiness, metrics);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .route("/validate", post(super::webhook::handle_validate))
        .with_state(state)
}

/// Serve probes, metrics and `/validate` over plain HTTP until `shutdown` fires
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = build_router(readiness, metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Health and metrics server listening (HTTP)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.stopped())
        .await
}

/// Same endpoints over HTTPS, required for the apiserver to call `/validate`
pub async fn run_health_server_tls(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
    tls_config: Arc<rustls::ServerConfig>,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    use axum_server::tls_rustls::RustlsConfig;

    let app = build_router(readiness, metrics);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let config = RustlsConfig::from_config(tls_config);

    let handle = axum_server::Handle::new();
    let drain = handle.clone();
    tokio::spawn(async move {
        shutdown.stopped().await;
        drain.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
    });

    info!(port = %port, "Health, metrics and webhook server listening (HTTPS)");

    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
}
