//! HTTP API for health checks and Prometheus metrics

use crate::health::{ComponentStatus, HealthRegistry};
use crate::registry::MetricsRegistry;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Default path the registry is exposed on
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub registry: MetricsRegistry,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, registry: MetricsRegistry) -> Self {
        Self {
            health_registry,
            registry,
        }
    }
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still publishing
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Health endpoint paths; the metrics path may not reuse them
pub const HEALTHZ_PATH: &str = "/healthz";
pub const READYZ_PATH: &str = "/readyz";

/// Normalize a configured metrics path and check that it can be routed
///
/// A leading `/` is added if missing. Paths that collide with the health
/// endpoints or contain route parameters (`:name`, `*rest`) are rejected.
pub fn normalize_metrics_path(metrics_path: &str) -> anyhow::Result<String> {
    let path = if metrics_path.starts_with('/') {
        metrics_path.to_string()
    } else {
        format!("/{}", metrics_path)
    };

    if path == HEALTHZ_PATH || path == READYZ_PATH {
        anyhow::bail!("metrics path {} collides with a health endpoint", path);
    }
    if path
        .split('/')
        .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
    {
        anyhow::bail!("metrics path {} must not contain route parameters", path);
    }

    Ok(path)
}

/// Create the API router, serving the registry on `metrics_path`
pub fn create_router(state: Arc<AppState>, metrics_path: &str) -> anyhow::Result<Router> {
    let metrics_path = normalize_metrics_path(metrics_path)?;

    Ok(Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(READYZ_PATH, get(readyz))
        .route(&metrics_path, get(metrics))
        .with_state(state))
}

/// Serve the API until `shutdown` completes
pub async fn serve(
    addr: SocketAddr,
    metrics_path: &str,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state, metrics_path)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, path = %metrics_path, "Starting metrics server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_path_gets_leading_slash() {
        assert_eq!(normalize_metrics_path("gpu-metrics").unwrap(), "/gpu-metrics");
        assert_eq!(normalize_metrics_path("/metrics").unwrap(), "/metrics");
    }

    #[test]
    fn test_metrics_path_rejects_health_endpoints() {
        assert!(normalize_metrics_path("/healthz").is_err());
        assert!(normalize_metrics_path("readyz").is_err());
    }

    #[test]
    fn test_metrics_path_rejects_route_parameters() {
        assert!(normalize_metrics_path("/metrics/:node").is_err());
        assert!(normalize_metrics_path("/*rest").is_err());
    }

    #[test]
    fn test_router_with_colliding_path_is_an_error() {
        let state = Arc::new(AppState::new(
            HealthRegistry::new(),
            MetricsRegistry::new().unwrap(),
        ));

        assert!(create_router(state.clone(), "/healthz").is_err());
        assert!(create_router(state, "/metrics").is_ok());
    }
}
