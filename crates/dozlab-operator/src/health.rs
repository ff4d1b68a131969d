//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for health check endpoints.
pub struct HealthState<C: ClusterClient> {
    /// Whether the operator has completed startup.
    started: AtomicBool,
    /// Client used to reach the API server.
    client: C,
}

impl<C: ClusterClient> HealthState<C> {
    pub fn new(client: C) -> Self {
        Self {
            started: AtomicBool::new(false),
            client,
        }
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Run the health check HTTP server.
///
/// Runs until the server hits a fatal error. The operator is marked as
/// started only after the listener is bound, so readiness can never be
/// reported before the probes are reachable.
pub async fn run_health_server<C: ClusterClient + 'static>(
    state: Arc<HealthState<C>>,
    port: u16,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<C>))
        .with_state(state.clone());

    // Localhost only; the kubelet probes from inside the pod network namespace
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");
    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe: 200 while the process is alive.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe: 200 once started and the API server answers, else 503.
async fn readyz<C: ClusterClient + 'static>(
    State(state): State<Arc<HealthState<C>>>,
) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.client.check_readiness().await {
        Ok(true) => {
            debug!("Readiness probe: OK");
            StatusCode::OK
        }
        Ok(false) => {
            debug!("Readiness probe: NOT READY (API server not ready)");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (API server unreachable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
