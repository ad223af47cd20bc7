use crate::idempotency::IdempotencyStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Ordered from best to worst, so the worst of several is their maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    pub fn is_degraded(&self) -> bool {
        *self == HealthStatus::Degraded
    }

    pub fn is_unhealthy(&self) -> bool {
        *self == HealthStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            latency_ms: None,
            message,
        }
    }

    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            ..Self::with_status(name, HealthStatus::Healthy, None)
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Grades a successful ping by its round-trip time.
    fn from_ping(name: String, latency_ms: f64, degraded_above_ms: f64) -> Self {
        if latency_ms > degraded_above_ms {
            Self {
                latency_ms: Some(latency_ms),
                ..Self::degraded(name, format!("Store round trip took {:.2}ms", latency_ms))
            }
        } else {
            Self::healthy(name, latency_ms)
        }
    }
}

/// Service health: the worst status among its dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = dependencies
            .iter()
            .map(|d| d.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }
}

/// Health checker for the idempotency cache store.
pub struct HealthChecker {
    store: Arc<dyn IdempotencyStore>,
    start_time: std::time::Instant,
}

impl HealthChecker {
    /// Latency above which the store is reported as degraded.
    const DEGRADED_LATENCY_MS: f64 = 50.0;
    const PING_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            start_time: std::time::Instant::now(),
        }
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.start_time.elapsed().as_secs(),
            vec![self.check_store().await],
        )
    }

    /// Pings the cache store.
    pub async fn check_store(&self) -> DependencyHealth {
        let name = format!("store:{}", self.store.backend_name());
        let start = std::time::Instant::now();

        match tokio::time::timeout(Self::PING_TIMEOUT, self.store.ping()).await {
            Ok(Ok(())) => DependencyHealth::from_ping(
                name,
                start.elapsed().as_secs_f64() * 1000.0,
                Self::DEGRADED_LATENCY_MS,
            ),
            Ok(Err(e)) => DependencyHealth::unhealthy(name, format!("PING failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy(name, "PING timeout"),
        }
    }

    pub fn is_alive(&self) -> bool {
        true
    }

    /// The filter fails closed, so an unreachable store means not ready.
    pub async fn is_ready(&self) -> bool {
        !self.check_store().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
