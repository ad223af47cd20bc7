use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, IdempotencyViolation};
use crate::observability::{DependencyHealth, HealthStatus};

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationErrorDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Validation error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

/// Resource created by the demo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Idempotency(IdempotencyViolation::InProgress) => {
                (StatusCode::CONFLICT, IdempotencyViolation::InProgress.code())
            }
            AppError::Idempotency(violation) => (StatusCode::BAD_REQUEST, violation.code()),
            AppError::Redis(_) | AppError::Serialization(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
            }
            AppError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            AppError::Configuration(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            AppError::Idempotency(_) | AppError::PayloadTooLarge(_) => self.to_string(),
            AppError::Redis(_) | AppError::Serialization(_) => {
                tracing::error!("Idempotency store failure: {}", self);
                "The idempotency store is unavailable".to_string()
            }
            AppError::Configuration(_) | AppError::Internal(_) => {
                tracing::error!("Request failed: {}", self);
                "An internal error occurred".to_string()
            }
        };

        (
            status,
            Json(ApiResponse::<()>::error(ErrorResponse::new(code, message))),
        )
            .into_response()
    }
}
