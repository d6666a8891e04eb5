// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! REST key-value store client against a mock server.

use serde_json::json;
use velo_sync::store::{KvStore, RestStore, StoreError};
use wiremock::matchers::{body_json, header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn reply(server: &MockServer, command: serde_json::Value, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer kv-token"))
        .and(body_json(command))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn client(server: &MockServer) -> RestStore {
    RestStore::new(format!("{}/", server.uri()), "kv-token").unwrap()
}

#[tokio::test]
async fn test_counter_commands() {
    let server = MockServer::start().await;
    reply(&server, json!(["INCRBY", "rl:k", "1"]), json!({"result": 4})).await;
    reply(&server, json!(["EXPIRE", "rl:k", "900"]), json!({"result": 1})).await;
    reply(&server, json!(["GET", "rl:k"]), json!({"result": "4"})).await;
    reply(&server, json!(["GET", "missing"]), json!({"result": null})).await;

    let store = client(&server);
    assert_eq!(store.incr_by("rl:k", 1).await.unwrap(), 4);
    assert!(store.expire("rl:k", 900).await.unwrap());
    assert_eq!(store.get("rl:k").await.unwrap().as_deref(), Some("4"));
    assert_eq!(store.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_list_commands() {
    let server = MockServer::start().await;
    reply(&server, json!(["RPUSH", "q", "a"]), json!({"result": 1})).await;
    reply(&server, json!(["LPUSH", "q", "z"]), json!({"result": 2})).await;
    reply(&server, json!(["LPOP", "q"]), json!({"result": "z"})).await;
    reply(&server, json!(["LLEN", "q"]), json!({"result": 1})).await;
    reply(&server, json!(["LRANGE", "q", "0", "-1"]), json!({"result": ["a"]})).await;

    let store = client(&server);
    assert_eq!(store.rpush("q", "a").await.unwrap(), 1);
    assert_eq!(store.lpush("q", "z").await.unwrap(), 2);
    assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("z"));
    assert_eq!(store.llen("q").await.unwrap(), 1);
    assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_blob_commands() {
    let server = MockServer::start().await;
    reply(&server, json!(["SETEX", "c", "60", "{}"]), json!({"result": "OK"})).await;
    reply(&server, json!(["DEL", "c"]), json!({"result": 1})).await;

    let store = client(&server);
    store.set_ex("c", 60, "{}").await.unwrap();
    assert!(store.del("c").await.unwrap());
}

#[tokio::test]
async fn test_error_reply_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "WRONGTYPE Operation against a key holding the wrong kind of value"
        })))
        .mount(&server)
        .await;

    let err = client(&server).incr_by("q", 1).await.unwrap_err();
    match err {
        StoreError::Protocol(msg) => assert!(msg.starts_with("WRONGTYPE")),
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server).get("k").await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn test_unreachable_store_is_unavailable() {
    let store = RestStore::new("http://127.0.0.1:9", "kv-token").unwrap();
    assert!(matches!(
        store.incr_by("k", 1).await,
        Err(StoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_window_ttl_is_retried_after_failed_expire() {
    use std::sync::Arc;
    use velo_sync::services::rate_limit::{ProviderLimits, RateLimiter, StoreErrorPolicy, TierLimits};
    use velo_sync::time_utils::ManualClock;

    let server = MockServer::start().await;
    // First increment creates the window, later ones find it.
    Mock::given(method("POST"))
        .and(body_json(json!(["INCRBY", "v:rl:tier:free:7:activity:hour:492346", "1"])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 1})))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_json(json!(["INCRBY", "v:rl:tier:free:7:activity:hour:492346", "1"])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 2})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_json(json!(["EXPIRE", "v:rl:tier:free:7:activity:hour:492346", "3600"])))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_json(json!(["EXPIRE", "v:rl:tier:free:7:activity:hour:492346", "3600"])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 1})))
        .expect(1)
        .mount(&server)
        .await;

    // 2026-03-02T10:07:00Z, hour window index 492346.
    let clock = Arc::new(ManualClock::at_ms(1_772_446_020_000));
    let limiter = RateLimiter::new(
        Arc::new(client(&server)),
        TierLimits::default(),
        ProviderLimits::default(),
        clock,
        "v",
    );

    let first = limiter
        .check_tier("u7", 7, "free", "activity", StoreErrorPolicy::FailClosed)
        .await
        .unwrap();
    assert!(first.allowed);
    assert_eq!(limiter.pending_ttls(), 1);

    let second = limiter
        .check_tier("u7", 7, "free", "activity", StoreErrorPolicy::FailClosed)
        .await
        .unwrap();
    assert_eq!(second.remaining, 98);
    assert_eq!(limiter.pending_ttls(), 0);

    // Nothing left to retry.
    limiter
        .check_tier("u7", 7, "free", "activity", StoreErrorPolicy::FailClosed)
        .await
        .unwrap();
}
