use crate::config::IdempotencySettings;
use crate::error::{AppError, IdempotencyViolation, Result};
use crate::idempotency::key::{CacheKey, CacheKeyGenerator, IdempotencyKey};
use crate::idempotency::storage::{Fingerprint, IdempotencyRecord, IdempotencyStore, StoredEntry};
use crate::observability::{get_metrics, mask_sensitive};
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub passthrough_requests: AtomicU64,
    pub fresh_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub uncached_responses: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_passthrough(&self) {
        self.passthrough_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fresh(&self) {
        self.fresh_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uncached(&self) {
        self.uncached_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            passthrough_requests: self.passthrough_requests.load(Ordering::Relaxed),
            fresh_requests: self.fresh_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            uncached_responses: self.uncached_responses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub passthrough_requests: u64,
    pub fresh_requests: u64,
    pub replayed_requests: u64,
    pub rejected_requests: u64,
    pub uncached_responses: u64,
}

impl MetricsSnapshot {
    /// Share of protocol-bound requests that were served from the store.
    pub fn replay_rate(&self) -> f64 {
        let applicable = self.total_requests - self.passthrough_requests;
        if applicable == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / applicable as f64
        }
    }
}

/// Configuration for the replay engine.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub main_header: HeaderName,
    pub repeated_header: HeaderName,
    /// Lifetime of a completed record.
    pub ttl: Duration,
    /// Lifetime of the reservation held while the downstream handler runs.
    pub lock_ttl: Duration,
    pub methods: Vec<Method>,
    pub key_prefix: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            main_header: HeaderName::from_static("idempotency-key"),
            repeated_header: HeaderName::from_static("idempotent-replayed"),
            ttl: Duration::from_secs(360 * 60), // 6 hours
            lock_ttl: Duration::from_secs(30),
            methods: vec![Method::POST],
            key_prefix: "idem".to_string(),
        }
    }
}

impl IdempotencyConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }
}

impl TryFrom<&IdempotencySettings> for IdempotencyConfig {
    type Error = AppError;

    fn try_from(settings: &IdempotencySettings) -> Result<Self> {
        let header = |name: &str| {
            HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                AppError::Configuration(format!("Invalid header name {:?}: {}", name, e))
            })
        };

        let main_header = header(&settings.main_header)?;
        let repeated_header = header(&settings.repeated_header)?;
        if main_header == repeated_header {
            return Err(AppError::Configuration(
                "Main and repeated idempotency headers must differ".to_string(),
            ));
        }

        if settings.expiration_minutes == 0 {
            return Err(AppError::Configuration(
                "Idempotency expiration must be at least one minute".to_string(),
            ));
        }
        let ttl_secs = settings.expiration_minutes.checked_mul(60).ok_or_else(|| {
            AppError::Configuration(format!(
                "Idempotency expiration of {} minutes is out of range",
                settings.expiration_minutes
            ))
        })?;

        if settings.lock_ttl_seconds == 0 {
            return Err(AppError::Configuration(
                "Idempotency lock TTL must be at least one second".to_string(),
            ));
        }

        let methods = settings
            .http_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_uppercase().as_bytes()).map_err(|e| {
                    AppError::Configuration(format!("Invalid HTTP method {:?}: {}", m, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if methods.is_empty() {
            return Err(AppError::Configuration(
                "At least one HTTP method must be subject to idempotency".to_string(),
            ));
        }

        Ok(Self {
            main_header,
            repeated_header,
            ttl: Duration::from_secs(ttl_secs),
            lock_ttl: Duration::from_secs(settings.lock_ttl_seconds),
            methods,
            key_prefix: settings.key_prefix.clone(),
        })
    }
}

/// Buffered view of an inbound request.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReplayRequest {
    pub fn new(method: Method, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Token from an `Authorization: Bearer <token>` header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.trim().split_once(' ')?;
        let token = token.trim();

        if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
            Some(token)
        } else {
            None
        }
    }
}

/// Buffered response produced by the downstream handler or rebuilt from the store.
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReplayResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Whether the idempotency protocol applies to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NotApplicable,
    Applicable { raw_key: String },
}

/// Result of comparing a repeated request against the stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Match,
    BodyConflict,
    PathConflict,
}

/// Successful outcome of running a request through the engine.
#[derive(Debug, Clone)]
pub enum ReplayOutcome {
    /// Protocol did not apply; the downstream response is untouched.
    Passthrough(ReplayResponse),
    /// First use of the key; the downstream handler ran.
    Fresh(ReplayResponse),
    /// Served from the store without invoking the downstream handler.
    Replayed(ReplayResponse),
}

impl ReplayOutcome {
    pub fn response(&self) -> &ReplayResponse {
        match self {
            ReplayOutcome::Passthrough(r) | ReplayOutcome::Fresh(r) | ReplayOutcome::Replayed(r) => r,
        }
    }

    pub fn into_response(self) -> ReplayResponse {
        match self {
            ReplayOutcome::Passthrough(r) | ReplayOutcome::Fresh(r) | ReplayOutcome::Replayed(r) => r,
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, ReplayOutcome::Replayed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            ReplayOutcome::Passthrough(_) => "passthrough",
            ReplayOutcome::Fresh(_) => "fresh",
            ReplayOutcome::Replayed(_) => "replayed",
        }
    }
}

/// Decides, per request, between pass-through, fresh execution, replay and rejection.
///
/// Holds no per-request state; everything that outlives a request lives in the store.
pub struct ReplayEngine {
    store: Arc<dyn IdempotencyStore>,
    keys: CacheKeyGenerator,
    config: IdempotencyConfig,
    metrics: Arc<IdempotencyMetrics>,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            keys: CacheKeyGenerator::new(config.key_prefix.clone()),
            config,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    /// Gets the metrics for this engine.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Applies iff the method is configured and the main header is present.
    pub fn classify(&self, method: &Method, headers: &HeaderMap) -> Classification {
        if !self.config.methods.contains(method) {
            return Classification::NotApplicable;
        }

        match headers.get(&self.config.main_header) {
            Some(value) => Classification::Applicable {
                raw_key: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            },
            None => Classification::NotApplicable,
        }
    }

    pub fn validate_key(&self, raw_key: &str) -> std::result::Result<IdempotencyKey, IdempotencyViolation> {
        IdempotencyKey::parse(raw_key)
    }

    /// Cache key for a request: the caller's bearer credential combined with the key.
    pub fn cache_key(&self, request: &ReplayRequest, key: &IdempotencyKey) -> CacheKey {
        self.keys.derive(request.bearer_token(), key)
    }

    pub async fn lookup(&self, cache_key: &CacheKey) -> Result<Option<StoredEntry>> {
        self.store.get(cache_key).await
    }

    /// Body is compared before path, both byte-exact.
    pub fn reconcile(fingerprint: &Fingerprint, request: &ReplayRequest) -> Reconciliation {
        if request.body != fingerprint.request_body {
            Reconciliation::BodyConflict
        } else if request.path != fingerprint.request_path {
            Reconciliation::PathConflict
        } else {
            Reconciliation::Match
        }
    }

    /// Rebuilds the stored response and marks it as a replay of `key`.
    pub fn serve_replay(&self, record: &IdempotencyRecord, key: &IdempotencyKey) -> Result<ReplayResponse> {
        let mut response = record.to_response()?;
        let value = Self::header_value(key)?;

        response
            .headers
            .insert(self.config.repeated_header.clone(), value.clone());
        response.headers.insert(self.config.main_header.clone(), value);

        Ok(response)
    }

    /// Runs a request through the idempotency protocol.
    ///
    /// `downstream` is invoked at most once, and never for replays or rejections.
    pub async fn handle<F, Fut>(&self, request: ReplayRequest, downstream: F) -> Result<ReplayOutcome>
    where
        F: FnOnce(ReplayRequest) -> Fut,
        Fut: Future<Output = Result<ReplayResponse>>,
    {
        self.metrics.record_request();

        let outcome = match self.classify(&request.method, &request.headers) {
            Classification::NotApplicable => {
                self.metrics.record_passthrough();
                tracing::debug!(method = %request.method, path = %request.path, "Idempotency not applicable");
                ReplayOutcome::Passthrough(downstream(request).await?)
            }
            Classification::Applicable { raw_key } => {
                let key = self
                    .validate_key(&raw_key)
                    .map_err(|violation| self.reject(violation, &request))?;
                let cache_key = self.cache_key(&request, &key);

                match self.lookup(&cache_key).await? {
                    Some(entry) => ReplayOutcome::Replayed(self.replay_or_reject(entry, &request, &key)?),
                    None => self.process_fresh(request, &cache_key, &key, downstream).await?,
                }
            }
        };

        get_metrics().record_idempotency_outcome(outcome.label());
        Ok(outcome)
    }

    /// First use of a key: reserve it, run the handler, then store or drop the outcome.
    ///
    /// The reservation is a short lease owned by this call. It is released if the
    /// handler fails, answers 422, or the returned future is dropped mid-flight.
    pub async fn process_fresh<F, Fut>(
        &self,
        request: ReplayRequest,
        cache_key: &CacheKey,
        key: &IdempotencyKey,
        downstream: F,
    ) -> Result<ReplayOutcome>
    where
        F: FnOnce(ReplayRequest) -> Fut,
        Fut: Future<Output = Result<ReplayResponse>>,
    {
        let fingerprint = Fingerprint::new(request.path.clone(), request.body.clone());
        let owner = Uuid::new_v4().to_string();

        if !self
            .store
            .try_reserve(cache_key, &fingerprint, &owner, self.config.lock_ttl)
            .await?
        {
            // Another request claimed the key between lookup and reservation.
            return match self.lookup(cache_key).await? {
                Some(entry) => Ok(ReplayOutcome::Replayed(
                    self.replay_or_reject(entry, &request, key)?,
                )),
                None => Err(self.reject(IdempotencyViolation::InProgress, &request)),
            };
        }

        let reservation = Reservation::new(self.store(), cache_key.clone(), owner);
        self.metrics.record_fresh();
        let path = request.path.clone();

        let mut response = match downstream(request).await {
            Ok(response) => response,
            Err(e) => {
                reservation.release().await;
                return Err(e);
            }
        };

        if response.status == StatusCode::UNPROCESSABLE_ENTITY {
            reservation.release().await;
            self.metrics.record_uncached();
            tracing::info!(
                idempotency_key = %mask_sensitive(key.as_str(), 4),
                path = %path,
                "Unprocessable response not cached"
            );
        } else {
            let record = IdempotencyRecord::capture(fingerprint, &response, self.config.ttl);
            let stored = self
                .store
                .complete(cache_key, reservation.owner(), &record, self.config.ttl)
                .await;

            match stored {
                Ok(true) => {
                    reservation.disarm();
                    tracing::info!(
                        idempotency_key = %mask_sensitive(key.as_str(), 4),
                        path = %path,
                        status = response.status.as_u16(),
                        ttl_secs = self.config.ttl.as_secs(),
                        "Stored idempotent response"
                    );
                }
                Ok(false) => {
                    reservation.disarm();
                    tracing::warn!(
                        idempotency_key = %mask_sensitive(key.as_str(), 4),
                        path = %path,
                        lock_ttl_secs = self.config.lock_ttl.as_secs(),
                        "Reservation lapsed and was taken over; response not cached"
                    );
                }
                Err(e) => {
                    reservation.release().await;
                    return Err(e);
                }
            }
        }

        response
            .headers
            .insert(self.config.main_header.clone(), Self::header_value(key)?);

        Ok(ReplayOutcome::Fresh(response))
    }

    fn replay_or_reject(
        &self,
        entry: StoredEntry,
        request: &ReplayRequest,
        key: &IdempotencyKey,
    ) -> Result<ReplayResponse> {
        match Self::reconcile(entry.fingerprint(), request) {
            Reconciliation::BodyConflict => Err(self.reject(IdempotencyViolation::BodyConflict, request)),
            Reconciliation::PathConflict => Err(self.reject(IdempotencyViolation::PathConflict, request)),
            Reconciliation::Match => match entry {
                StoredEntry::Completed(record) => {
                    let response = self.serve_replay(&record, key)?;
                    self.metrics.record_replayed();
                    tracing::info!(
                        idempotency_key = %mask_sensitive(key.as_str(), 4),
                        path = %request.path,
                        status = response.status.as_u16(),
                        "Replaying stored response"
                    );
                    Ok(response)
                }
                StoredEntry::InFlight { .. } => Err(self.reject(IdempotencyViolation::InProgress, request)),
            },
        }
    }

    fn reject(&self, violation: IdempotencyViolation, request: &ReplayRequest) -> AppError {
        self.metrics.record_rejected();
        get_metrics().record_idempotency_outcome(violation.code());
        tracing::warn!(
            method = %request.method,
            path = %request.path,
            code = violation.code(),
            "Idempotent request rejected"
        );
        AppError::Idempotency(violation)
    }

    fn header_value(key: &IdempotencyKey) -> Result<HeaderValue> {
        HeaderValue::from_str(key.as_str()).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Idempotency key is not a valid header value: {}", e))
        })
    }
}

/// A held reservation. Dropping it while still armed releases the key in the
/// background, which covers a request future cancelled mid-handler.
struct Reservation {
    store: Arc<dyn IdempotencyStore>,
    cache_key: CacheKey,
    owner: String,
    armed: bool,
}

impl Reservation {
    fn new(store: Arc<dyn IdempotencyStore>, cache_key: CacheKey, owner: String) -> Self {
        Self {
            store,
            cache_key,
            owner,
            armed: true,
        }
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    /// The reservation was turned into a record (or lost); nothing to undo.
    fn disarm(mut self) {
        self.armed = false;
    }

    /// Releases now. Failures are logged; the lease bounds how long they block the key.
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.store.release(&self.cache_key, &self.owner).await {
            tracing::error!("Failed to release idempotency reservation: {}", e);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to release abandoned idempotency reservation");
            return;
        };

        let store = Arc::clone(&self.store);
        let cache_key = self.cache_key.clone();
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move {
            match store.release(&cache_key, &owner).await {
                Ok(true) => tracing::info!("Released reservation of abandoned request"),
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to release abandoned reservation: {}", e),
            }
        });
    }
}

/// Background cleanup job for stores that do not expire entries themselves.
pub struct IdempotencyCleanupJob {
    store: Arc<dyn IdempotencyStore>,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(store: Arc<dyn IdempotencyStore>, interval_seconds: u64) -> Self {
        Self {
            store,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.store.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                self.interval_seconds.max(1),
            ));

            loop {
                interval.tick().await;

                match self.store.cleanup_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
