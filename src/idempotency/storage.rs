use crate::error::{AppError, Result};
use crate::idempotency::engine::ReplayResponse;
use crate::idempotency::key::CacheKey;
use crate::observability::get_metrics;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// The (path, body) pair that identifies one logical operation behind a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub request_path: String,
    #[serde(with = "hex_bytes")]
    pub request_body: Bytes,
}

impl Fingerprint {
    pub fn new(request_path: impl Into<String>, request_body: impl Into<Bytes>) -> Self {
        Self {
            request_path: request_path.into(),
            request_body: request_body.into(),
        }
    }
}

/// Stored outcome of the first request made with a key. Never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status_code: u16,
    pub response_headers: BTreeMap<String, Vec<String>>,
    #[serde(with = "hex_bytes")]
    pub response_body: Bytes,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Captures a downstream response together with the request fingerprint.
    pub fn capture(fingerprint: Fingerprint, response: &ReplayResponse, ttl: Duration) -> Self {
        let mut response_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers.iter() {
            response_headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));

        Self {
            status_code: response.status.as_u16(),
            response_headers,
            response_body: response.body.clone(),
            fingerprint,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn request_path(&self) -> &str {
        &self.fingerprint.request_path
    }

    pub fn request_body(&self) -> &Bytes {
        &self.fingerprint.request_body
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Rebuilds the stored response with its original status, headers and body.
    pub fn to_response(&self) -> Result<ReplayResponse> {
        let status = StatusCode::from_u16(self.status_code).map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Stored status code {} is invalid: {}",
                self.status_code,
                e
            ))
        })?;

        let mut headers = HeaderMap::new();
        for (name, values) in &self.response_headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!(header = %name, "Skipping stored header with invalid name");
                continue;
            };
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        headers.append(name.clone(), value);
                    }
                    Err(_) => {
                        tracing::warn!(header = %name, "Skipping stored header with invalid value");
                    }
                }
            }
        }

        Ok(ReplayResponse {
            status,
            headers,
            body: self.response_body.clone(),
        })
    }
}

/// What the store holds under a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StoredEntry {
    /// Reserved by a request whose downstream handler has not finished yet.
    /// Only the holder of `owner` may complete or release it.
    InFlight {
        fingerprint: Fingerprint,
        owner: String,
        reserved_at: DateTime<Utc>,
    },
    Completed(IdempotencyRecord),
}

impl StoredEntry {
    pub fn in_flight(fingerprint: Fingerprint, owner: impl Into<String>) -> Self {
        StoredEntry::InFlight {
            fingerprint,
            owner: owner.into(),
            reserved_at: Utc::now(),
        }
    }

    /// True for a reservation held by `owner`.
    pub fn is_reserved_by(&self, owner: &str) -> bool {
        matches!(self, StoredEntry::InFlight { owner: held, .. } if held == owner)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            StoredEntry::InFlight { fingerprint, .. } => fingerprint,
            StoredEntry::Completed(record) => &record.fingerprint,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StoredEntry::Completed(_))
    }
}

/// Cache store consumed by the replay engine.
///
/// Expiry is the store's job: an entry whose TTL has lapsed must read as absent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>>;

    async fn has(&self, key: &CacheKey) -> Result<bool>;

    /// Writes a completed record unconditionally.
    async fn put(&self, key: &CacheKey, record: &IdempotencyRecord, ttl: Duration) -> Result<()>;

    /// Atomically reserves `key` for `owner` if nothing is stored under it.
    /// Returns false when another entry already exists.
    async fn try_reserve(
        &self,
        key: &CacheKey,
        fingerprint: &Fingerprint,
        owner: &str,
        lease: Duration,
    ) -> Result<bool>;

    /// Replaces `owner`'s reservation with a completed record.
    ///
    /// Also writes when the key is vacant (the lease lapsed with nobody else
    /// claiming it). Returns false, writing nothing, when the key holds a
    /// completed record or another owner's reservation.
    async fn complete(
        &self,
        key: &CacheKey,
        owner: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool>;

    /// Deletes `owner`'s reservation. Anything else under `key` is left alone.
    async fn release(&self, key: &CacheKey, owner: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()>;

    /// Evicts lapsed entries for stores that do not expire them on their own.
    async fn cleanup_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// KEYS[1] cache key; ARGV[1] owner, ARGV[2] completed entry, ARGV[3] ttl seconds.
const COMPLETE_SCRIPT: &str = r#"
local current = redis.call("get", KEYS[1])
if current then
    local entry = cjson.decode(current)
    if entry.state ~= "in_flight" or entry.owner ~= ARGV[1] then
        return 0
    end
end
redis.call("set", KEYS[1], ARGV[2], "EX", ARGV[3])
return 1
"#;

/// KEYS[1] cache key; ARGV[1] owner.
const RELEASE_SCRIPT: &str = r#"
local current = redis.call("get", KEYS[1])
if not current then
    return 0
end
local entry = cjson.decode(current)
if entry.state == "in_flight" and entry.owner == ARGV[1] then
    return redis.call("del", KEYS[1])
end
return 0
"#;

/// Redis-backed store. Entries are JSON documents expired by Redis itself.
pub struct RedisIdempotencyStore {
    client: redis::Client,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    fn record_operation(operation: &str, start: std::time::Instant, success: bool) {
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        get_metrics().record_store_operation(operation, duration_ms, success);
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>> {
        let start = std::time::Instant::now();
        let mut conn = self.connection().await?;

        let value: Option<String> = conn.get(key.as_str()).await.map_err(|e| {
            Self::record_operation("get", start, false);
            AppError::Redis(e)
        })?;
        Self::record_operation("get", start, true);

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn has(&self, key: &CacheKey) -> Result<bool> {
        let start = std::time::Instant::now();
        let mut conn = self.connection().await?;

        let exists: bool = conn.exists(key.as_str()).await.map_err(|e| {
            Self::record_operation("has", start, false);
            AppError::Redis(e)
        })?;
        Self::record_operation("has", start, true);

        Ok(exists)
    }

    async fn put(&self, key: &CacheKey, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(&StoredEntry::Completed(record.clone()))?;
        let start = std::time::Instant::now();
        let mut conn = self.connection().await?;

        let _: () = conn
            .set_ex(key.as_str(), json, ttl_secs(ttl))
            .await
            .map_err(|e| {
                Self::record_operation("put", start, false);
                AppError::Redis(e)
            })?;
        Self::record_operation("put", start, true);

        Ok(())
    }

    async fn try_reserve(
        &self,
        key: &CacheKey,
        fingerprint: &Fingerprint,
        owner: &str,
        lease: Duration,
    ) -> Result<bool> {
        let json = serde_json::to_string(&StoredEntry::in_flight(fingerprint.clone(), owner))?;
        let start = std::time::Instant::now();
        let mut conn = self.connection().await?;

        let result: Option<String> = conn
            .set_options(
                key.as_str(),
                json,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(ttl_secs(lease) as usize)),
            )
            .await
            .map_err(|e| {
                Self::record_operation("reserve", start, false);
                AppError::Redis(e)
            })?;
        Self::record_operation("reserve", start, true);

        Ok(result.is_some())
    }

    async fn complete(
        &self,
        key: &CacheKey,
        owner: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool> {
        let json = serde_json::to_string(&StoredEntry::Completed(record.clone()))?;
        let start = std::time::Instant::now();
        let mut conn = self.connection().await?;

        let written: i64 = Script::new(COMPLETE_SCRIPT)
            .key(key.as_str())
            .arg(owner)
            .arg(json)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                Self::record_operation("complete", start, false);
                AppError::Redis(e)
            })?;
        Self::record_operation("complete", start, true);

        Ok(written == 1)
    }

    async fn release(&self, key: &CacheKey, owner: &str) -> Result<bool> {
        let start = std::time::Instant::now();
        let mut conn = self.connection().await?;

        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key.as_str())
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                Self::record_operation("release", start, false);
                AppError::Redis(e)
            })?;
        Self::record_operation("release", start, true);

        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(AppError::Redis)
    }
}

struct MemoryEntry {
    entry: StoredEntry,
    expires_at: Instant,
}

/// Process-local store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<CacheKey, MemoryEntry>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until evicted.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>> {
        let mut guard = self.entries.lock().await;

        let expired = match guard.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => {
                return Ok(Some(stored.entry.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            guard.remove(key);
        }
        Ok(None)
    }

    async fn has(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn put(&self, key: &CacheKey, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        let mut guard = self.entries.lock().await;
        guard.insert(
            key.clone(),
            MemoryEntry {
                entry: StoredEntry::Completed(record.clone()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn try_reserve(
        &self,
        key: &CacheKey,
        fingerprint: &Fingerprint,
        owner: &str,
        lease: Duration,
    ) -> Result<bool> {
        let mut guard = self.entries.lock().await;
        let now = Instant::now();

        if guard.get(key).is_some_and(|existing| existing.expires_at > now) {
            return Ok(false);
        }

        guard.insert(
            key.clone(),
            MemoryEntry {
                entry: StoredEntry::in_flight(fingerprint.clone(), owner),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn complete(
        &self,
        key: &CacheKey,
        owner: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<bool> {
        let mut guard = self.entries.lock().await;
        let now = Instant::now();

        let vacant_or_owned = match guard.get(key) {
            Some(existing) if existing.expires_at > now => existing.entry.is_reserved_by(owner),
            _ => true,
        };
        if !vacant_or_owned {
            return Ok(false);
        }

        guard.insert(
            key.clone(),
            MemoryEntry {
                entry: StoredEntry::Completed(record.clone()),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &CacheKey, owner: &str) -> Result<bool> {
        let mut guard = self.entries.lock().await;

        if guard.get(key).is_some_and(|existing| existing.entry.is_reserved_by(owner)) {
            guard.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let mut guard = self.entries.lock().await;
        let now = Instant::now();
        let before = guard.len();
        guard.retain(|_, stored| stored.expires_at > now);
        Ok((before - guard.len()) as u64)
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
