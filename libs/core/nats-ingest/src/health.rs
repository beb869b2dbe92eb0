//! Probe and scrape endpoints served next to the consumers.
//!
//! `/health` (`/healthz`) never fails while the process runs: a broker outage is
//! retried in-process and must not get the pod restarted. `/ready` (`/readyz`) is 503
//! until the service is connected and its installation consumer is up.

use crate::service::IngestService;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Body of the liveness and readiness endpoints
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub connected: bool,
    pub installation_running: bool,
    pub active_scopes: usize,
}

#[derive(Clone)]
struct ProbeState {
    service: Arc<IngestService>,
    metrics: Option<PrometheusHandle>,
}

impl ProbeState {
    async fn snapshot(&self) -> (bool, HealthStatus) {
        let ready = self.service.is_ready().await;
        let status = HealthStatus {
            status: if ready { "healthy" } else { "degraded" }.to_string(),
            connected: self.service.is_connected(),
            installation_running: self.service.installation_running().await,
            active_scopes: self.service.registry().len(),
        };
        (ready, status)
    }
}

pub struct HealthServer {
    port: u16,
    state: ProbeState,
}

impl HealthServer {
    pub fn new(port: u16, service: Arc<IngestService>) -> Self {
        Self {
            port,
            state: ProbeState {
                service,
                metrics: None,
            },
        }
    }

    /// Serve the Prometheus recorder on `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(liveness))
            .route("/healthz", get(liveness))
            .route("/ready", get(readiness))
            .route("/readyz", get(readiness))
            .route("/metrics", get(scrape))
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Health server listening");

        axum::serve(listener, self.router()).await
    }
}

async fn liveness(State(state): State<ProbeState>) -> Json<HealthStatus> {
    let (_, status) = state.snapshot().await;
    Json(status)
}

async fn readiness(State(state): State<ProbeState>) -> Response {
    match state.snapshot().await {
        (true, status) => (StatusCode::OK, Json(status)).into_response(),
        (false, status) => (StatusCode::SERVICE_UNAVAILABLE, Json(status)).into_response(),
    }
}

async fn scrape(State(state): State<ProbeState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
