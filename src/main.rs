use idempotency_guard::api::{create_router, AppState};
use idempotency_guard::config::{Settings, StoreBackend};
use idempotency_guard::idempotency::{
    IdempotencyCleanupJob, IdempotencyConfig, IdempotencyStore, MemoryIdempotencyStore,
    RedisIdempotencyStore, ReplayEngine,
};
use idempotency_guard::observability::{init_logging, init_metrics, LogConfig};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::from(&settings.logging));
    info!("Configuration loaded");

    let config = IdempotencyConfig::try_from(&settings.idempotency)?;

    let store: Arc<dyn IdempotencyStore> = match settings.idempotency.store {
        StoreBackend::Redis => {
            info!("Connecting to Redis at {}...", settings.redis.url);
            let client = redis::Client::open(settings.redis.url.as_str())?;
            let store = RedisIdempotencyStore::new(client);
            store.ping().await?;
            info!("Redis connection established");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            info!("Using in-memory idempotency store");
            let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
            IdempotencyCleanupJob::new(
                Arc::clone(&store),
                settings.idempotency.cleanup_interval_seconds,
            )
            .start();
            store
        }
    };

    let metrics_handle = init_metrics()?;
    let engine = Arc::new(ReplayEngine::new(store, config));
    let state = AppState::new(engine, settings.idempotency.max_body_bytes).with_metrics(metrics_handle);

    let app = create_router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
