use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Client-visible failures of the idempotency protocol.
///
/// All of them are raised before the downstream handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdempotencyViolation {
    #[error("The given idempotency key is invalid. Please ensure the key is a valid UUID value.")]
    InvalidKey,

    #[error("A resource has been created with this idempotency key but with different content.")]
    BodyConflict,

    #[error("A resource has been created with this idempotency key but on a different endpoint.")]
    PathConflict,

    #[error("A request with this idempotency key is currently being processed. Please retry later.")]
    InProgress,
}

impl IdempotencyViolation {
    /// Stable machine-readable code used in error envelopes and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            IdempotencyViolation::InvalidKey => "INVALID_IDEMPOTENCY_KEY",
            IdempotencyViolation::BodyConflict => "IDEMPOTENCY_BODY_CONFLICT",
            IdempotencyViolation::PathConflict => "IDEMPOTENCY_PATH_CONFLICT",
            IdempotencyViolation::InProgress => "IDEMPOTENCY_IN_PROGRESS",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyViolation),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Returns the violation if this error is a protocol rejection.
    pub fn violation(&self) -> Option<IdempotencyViolation> {
        match self {
            AppError::Idempotency(v) => Some(*v),
            _ => None,
        }
    }

    /// True for failures of the backing cache store.
    pub fn is_store_error(&self) -> bool {
        matches!(self, AppError::Redis(_) | AppError::Serialization(_))
    }
}
