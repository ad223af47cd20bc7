#![allow(dead_code)]

use http::{HeaderName, HeaderValue, Method, StatusCode};
use idempotency_guard::error::Result;
use idempotency_guard::idempotency::{
    IdempotencyConfig, MemoryIdempotencyStore, ReplayEngine, ReplayRequest, ReplayResponse,
};
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const TOKEN: &str = "tenant-a-token";

pub fn new_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn memory_engine(config: IdempotencyConfig) -> (Arc<MemoryIdempotencyStore>, ReplayEngine) {
    let store = Arc::new(MemoryIdempotencyStore::new());
    let engine = ReplayEngine::new(store.clone(), config);
    (store, engine)
}

pub fn idempotent_request(method: Method, path: &str, body: &'static str, key: &str) -> ReplayRequest {
    ReplayRequest::new(method, path, body)
        .with_header(
            HeaderName::from_static("idempotency-key"),
            HeaderValue::from_str(key).unwrap(),
        )
        .with_header(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", TOKEN)).unwrap(),
        )
}

pub fn idempotent_post(path: &str, body: &'static str, key: &str) -> ReplayRequest {
    idempotent_request(Method::POST, path, body, key)
}

/// Stand-in for the real handler that counts its invocations.
#[derive(Clone, Default)]
pub struct Downstream {
    calls: Arc<AtomicUsize>,
}

impl Downstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn respond(
        &self,
        status: StatusCode,
        body: &'static str,
    ) -> impl FnOnce(ReplayRequest) -> Ready<Result<ReplayResponse>> {
        let calls = Arc::clone(&self.calls);
        move |_request| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut response = ReplayResponse::new(status, body);
            response
                .headers
                .insert("x-handler-call", HeaderValue::from(call as u64));
            ready(Ok(response))
        }
    }
}
