pub mod engine;
pub mod key;
pub mod storage;

pub use engine::{
    Classification, IdempotencyCleanupJob, IdempotencyConfig, IdempotencyMetrics, MetricsSnapshot,
    Reconciliation, ReplayEngine, ReplayOutcome, ReplayRequest, ReplayResponse,
};
pub use key::{CacheKey, CacheKeyGenerator, IdempotencyKey};
pub use storage::{
    Fingerprint, IdempotencyRecord, IdempotencyStore, MemoryIdempotencyStore,
    RedisIdempotencyStore, StoredEntry,
};
