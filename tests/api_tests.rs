//! End-to-end tests through the axum router.

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use common::{new_key, TOKEN};
use idempotency_guard::api::{create_router, with_idempotency, AppState};
use idempotency_guard::idempotency::{IdempotencyConfig, MemoryIdempotencyStore, ReplayEngine};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceExt;

fn test_state(max_body_bytes: usize) -> AppState {
    let engine = ReplayEngine::new(
        Arc::new(MemoryIdempotencyStore::new()),
        IdempotencyConfig::default(),
    );
    AppState::new(Arc::new(engine), max_body_bytes)
}

fn create_request(body: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/resources")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", TOKEN));

    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }

    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_repeat_returns_same_resource() {
    let state = test_state(1024 * 1024);
    let app = create_router(state.clone());
    let key = new_key();

    let first = app
        .clone()
        .oneshot(create_request(r#"{"name":"invoice"}"#, Some(&key)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(first.headers()["idempotency-key"], key.as_str());
    assert!(first.headers().get("idempotent-replayed").is_none());
    let first_body = json_body(first).await;

    let second = app
        .oneshot(create_request(r#"{"name":"invoice"}"#, Some(&key)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(second.headers()["idempotent-replayed"], key.as_str());
    assert_eq!(
        second.headers()["content-type"],
        "application/json"
    );
    let second_body = json_body(second).await;

    assert_eq!(first_body["data"]["id"], second_body["data"]["id"]);
    assert_eq!(state.created_resources.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_requests_without_key_are_not_deduplicated() {
    let state = test_state(1024 * 1024);
    let app = create_router(state.clone());

    let first = json_body(
        app.clone()
            .oneshot(create_request(r#"{"name":"a"}"#, None))
            .await
            .unwrap(),
    )
    .await;
    let second = json_body(
        app.oneshot(create_request(r#"{"name":"a"}"#, None))
            .await
            .unwrap(),
    )
    .await;

    assert_ne!(first["data"]["id"], second["data"]["id"]);
    assert_eq!(state.created_resources.load(Ordering::SeqCst), 2);
    assert_eq!(state.engine.metrics().snapshot().total_requests, 0);
}

#[tokio::test]
async fn test_changed_body_is_rejected() {
    let state = test_state(1024 * 1024);
    let app = create_router(state.clone());
    let key = new_key();

    app.clone()
        .oneshot(create_request(r#"{"name":"a"}"#, Some(&key)))
        .await
        .unwrap();

    let response = app
        .oneshot(create_request(r#"{"name":"b"}"#, Some(&key)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "IDEMPOTENCY_BODY_CONFLICT");
    assert_eq!(
        body["error"]["message"],
        "A resource has been created with this idempotency key but with different content."
    );
    assert_eq!(state.created_resources.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_key_is_rejected() {
    let state = test_state(1024 * 1024);
    let app = create_router(state.clone());

    let response = app
        .oneshot(create_request(r#"{"name":"a"}"#, Some("fake-idempotency-key")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "INVALID_IDEMPOTENCY_KEY");
    assert_eq!(state.created_resources.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_validation_failure_is_not_cached() {
    let state = test_state(1024 * 1024);
    let app = create_router(state.clone());
    let key = new_key();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(create_request(r#"{"name":""}"#, Some(&key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(response.headers().get("idempotent-replayed").is_none());
    }

    let response = app
        .oneshot(create_request(r#"{"name":"fixed"}"#, Some(&key)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let snapshot = state.engine.metrics().snapshot();
    assert_eq!(snapshot.fresh_requests, 3);
    assert_eq!(snapshot.uncached_responses, 2);
}

#[tokio::test]
async fn test_other_endpoint_is_path_conflict() {
    let state = test_state(1024 * 1024);
    let guarded = with_idempotency(
        Router::new()
            .route("/v1/orders", post(|| async { (StatusCode::CREATED, "order") }))
            .route("/v1/refunds", post(|| async { (StatusCode::CREATED, "refund") })),
        &state,
    );
    let app = guarded.with_state(state);
    let key = new_key();

    let request = |uri: &str| {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("idempotency-key", key.as_str())
            .body(Body::from("{}"))
            .unwrap()
    };

    let first = app.clone().oneshot(request("/v1/orders")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = app.oneshot(request("/v1/refunds")).await.unwrap();
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    let body = json_body(second).await;
    assert_eq!(body["error"]["code"], "IDEMPOTENCY_PATH_CONFLICT");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let state = test_state(16);
    let app = create_router(state.clone());
    let key = new_key();

    let response = app
        .oneshot(create_request(
            r#"{"name":"a name that does not fit"}"#,
            Some(&key),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(state.created_resources.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = create_router(test_state(1024));

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["dependencies"][0]["name"], "store:memory");

    for uri in ["/ready", "/live"] {
        let response = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
    }

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stats_endpoint_reports_replays() {
    let state = test_state(1024 * 1024);
    let app = create_router(state);
    let key = new_key();

    for _ in 0..3 {
        app.clone()
            .oneshot(create_request(r#"{"name":"a"}"#, Some(&key)))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(Request::get("/idempotency/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["fresh_requests"], 1);
    assert_eq!(body["data"]["replayed_requests"], 2);
}
