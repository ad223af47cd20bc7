use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use super::{handlers, middleware};
use crate::idempotency::ReplayEngine;
use crate::observability::HealthChecker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReplayEngine>,
    pub health_checker: Arc<HealthChecker>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub max_body_bytes: usize,
    /// Number of times the demo handler actually ran.
    pub created_resources: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(engine: Arc<ReplayEngine>, max_body_bytes: usize) -> Self {
        let health_checker = Arc::new(HealthChecker::new(engine.store()));
        Self {
            engine,
            health_checker,
            metrics_handle: None,
            max_body_bytes,
            created_resources: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Replaces the default health checker.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = checker;
        self
    }
}

/// Wraps every route of `router` with the idempotency filter.
pub fn with_idempotency(router: Router<AppState>, state: &AppState) -> Router<AppState> {
    router.route_layer(from_fn_with_state(
        state.clone(),
        middleware::idempotency_middleware,
    ))
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let guarded = with_idempotency(
        Router::new().route("/v1/resources", post(handlers::create_resource)),
        &state,
    );

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoints
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/idempotency/stats", get(handlers::idempotency_stats))
        .merge(guarded)
        .layer(from_fn(middleware::track_http_metrics))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
