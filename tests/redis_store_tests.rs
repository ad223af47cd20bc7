//! Redis-backed store tests. Run with `cargo test -- --ignored` against a live Redis.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use idempotency_guard::idempotency::{
    CacheKey, CacheKeyGenerator, Fingerprint, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    RedisIdempotencyStore, ReplayResponse, StoredEntry,
};
use std::time::Duration;
use uuid::Uuid;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn redis_store() -> RedisIdempotencyStore {
    let client = redis::Client::open(get_redis_url()).expect("Invalid Redis URL");
    RedisIdempotencyStore::new(client)
}

fn unique_key() -> CacheKey {
    let key = IdempotencyKey::parse(&Uuid::new_v4().to_string()).unwrap();
    CacheKeyGenerator::new("idem_test").derive(Some("redis-tests"), &key)
}

fn fingerprint() -> Fingerprint {
    Fingerprint::new("/v1/resources", Bytes::from_static(b"{\"name\":\"a\"}"))
}

fn record(ttl: Duration) -> IdempotencyRecord {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    let response = ReplayResponse {
        status: StatusCode::CREATED,
        headers,
        body: Bytes::from_static(b"{\"id\":\"r-1\"}"),
    };
    IdempotencyRecord::capture(fingerprint(), &response, ttl)
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_redis_second_reserve_is_refused() {
    let store = redis_store();
    store.ping().await.expect("Redis not reachable");
    let key = unique_key();
    let lease = Duration::from_secs(30);

    assert!(store.try_reserve(&key, &fingerprint(), "a", lease).await.unwrap());
    assert!(!store.try_reserve(&key, &fingerprint(), "b", lease).await.unwrap());

    let entry = store.get(&key).await.unwrap().unwrap();
    assert!(entry.is_reserved_by("a"));
    assert_eq!(entry.fingerprint(), &fingerprint());

    store.release(&key, "a").await.unwrap();
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_redis_put_then_get_round_trips_record() {
    let store = redis_store();
    let key = unique_key();
    let record = record(Duration::from_secs(60));

    store.put(&key, &record, Duration::from_secs(60)).await.unwrap();

    let entry = store.get(&key).await.unwrap().unwrap();
    assert_eq!(entry, StoredEntry::Completed(record.clone()));
    assert!(store.has(&key).await.unwrap());

    let response = match entry {
        StoredEntry::Completed(stored) => stored.to_response().unwrap(),
        StoredEntry::InFlight { .. } => panic!("expected completed record"),
    };
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body, record.response_body);
    assert_eq!(response.headers["content-type"], "application/json");
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_redis_release_makes_key_reservable() {
    let store = redis_store();
    let key = unique_key();
    let lease = Duration::from_secs(30);

    assert!(store.try_reserve(&key, &fingerprint(), "a", lease).await.unwrap());
    assert!(!store.release(&key, "someone-else").await.unwrap());
    assert!(store.has(&key).await.unwrap());

    assert!(store.release(&key, "a").await.unwrap());
    assert!(!store.has(&key).await.unwrap());
    assert!(store.try_reserve(&key, &fingerprint(), "b", lease).await.unwrap());

    store.release(&key, "b").await.unwrap();
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_redis_complete_replaces_own_reservation_only() {
    let store = redis_store();
    let key = unique_key();
    let record = record(Duration::from_secs(60));

    store
        .try_reserve(&key, &fingerprint(), "a", Duration::from_secs(30))
        .await
        .unwrap();

    assert!(!store.complete(&key, "b", &record, Duration::from_secs(60)).await.unwrap());
    assert!(store.get(&key).await.unwrap().unwrap().is_reserved_by("a"));

    assert!(store.complete(&key, "a", &record, Duration::from_secs(60)).await.unwrap());
    assert!(store.get(&key).await.unwrap().unwrap().is_completed());

    assert!(!store.complete(&key, "a", &record, Duration::from_secs(60)).await.unwrap());
    assert!(!store.release(&key, "a").await.unwrap());
}

#[tokio::test]
#[ignore = "Requires running Redis"]
async fn test_redis_entries_expire_after_ttl() {
    let store = redis_store();
    let key = unique_key();
    let lease_key = unique_key();

    store.put(&key, &record(Duration::from_secs(1)), Duration::from_secs(1)).await.unwrap();
    store
        .try_reserve(&lease_key, &fingerprint(), "a", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(store.has(&key).await.unwrap());

    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert!(store.get(&key).await.unwrap().is_none());
    assert!(!store.has(&lease_key).await.unwrap());
}
