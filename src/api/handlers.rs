use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::atomic::Ordering;
use uuid::Uuid;

use crate::api::requests::CreateResourceRequest;
use crate::api::responses::{
    ApiResponse, ErrorResponse, HealthResponse, ResourceResponse, ValidationErrorDetail,
};
use crate::idempotency::MetricsSnapshot;

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let health = state.health_checker.check_all().await;

    let response = HealthResponse {
        status: health.status,
        version: health.version,
        timestamp: chrono::Utc::now(),
        uptime_seconds: health.uptime_seconds,
        dependencies: health.dependencies,
    };

    Json(ApiResponse::success(response))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// In-process counters of the replay engine.
pub async fn idempotency_stats(State(state): State<AppState>) -> Json<ApiResponse<MetricsSnapshot>> {
    Json(ApiResponse::success(state.engine.metrics().snapshot()))
}

// ============================================================================
// Demo Handlers
// ============================================================================

/// Creates a resource. Each call that reaches this handler mints a new id.
pub async fn create_resource(
    State(state): State<AppState>,
    Json(request): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ResourceResponse>>), (StatusCode, Json<ApiResponse<()>>)> {
    if let Err(errors) = request.validate() {
        let details: Vec<ValidationErrorDetail> = errors
            .into_iter()
            .map(|e| ValidationErrorDetail {
                field: e.field,
                message: e.message,
            })
            .collect();

        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiResponse::<()>::error(
                ErrorResponse::new("VALIDATION_ERROR", "Request validation failed")
                    .with_details(details),
            )),
        ));
    }

    state.created_resources.fetch_add(1, Ordering::SeqCst);

    let resource = ResourceResponse {
        id: Uuid::new_v4(),
        name: request.name,
        created_at: chrono::Utc::now(),
    };
    tracing::info!(resource_id = %resource.id, "Resource created");

    Ok((StatusCode::CREATED, Json(ApiResponse::success(resource))))
}
