// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Tests for the authenticated read API and on-demand sync.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
};
use std::collections::BTreeMap;
use tower::ServiceExt;
use velo_sync::config::Config;
use velo_sync::db::Persistence;
use velo_sync::models::{AthleteCredential, AuditKind};
use velo_sync::services::queue::{Dequeued, Job, Lane};
use velo_sync::services::rate_limit::TierLimits;
use wiremock::matchers::{bearer_token, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;

async fn get(app: &common::TestApp, uri: &str, token: Option<&str>) -> Response {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    app.router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn mock_activity(server: &MockServer, id: u64, times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v3/activities/{}", id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::strava_activity_json(id)))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_api_requires_auth() {
    let app = common::create_test_app();

    let response = get(&app, "/api/activities/1", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = get(&app, "/api/activities/1", Some("not.a.jwt")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_cookie_is_accepted() {
    let server = MockServer::start().await;
    mock_activity(&server, 3, 1).await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/activities/3")
                .header(
                    header::COOKIE,
                    format!("velo_token={}", common::create_test_jwt(7, "free")),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_activity_miss_then_cache_hit() {
    let server = MockServer::start().await;
    // Second read must come from cache.
    mock_activity(&server, 42, 1).await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;
    let token = common::create_test_jwt(7, "free");

    let first = get(&app, "/api/activities/42", Some(&token)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let headers = first.headers().clone();
    assert_eq!(headers.get("x-cache").unwrap(), "MISS");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "99");
    assert!(headers.get("x-ratelimit-reset").is_some());
    assert_eq!(
        headers.get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=60, s-maxage=60"
    );
    assert_eq!(headers.get(header::VARY).unwrap(), "Authorization");
    let etag = headers.get(header::ETAG).unwrap().to_str().unwrap().to_string();
    let body = json_body(first).await;
    assert_eq!(body["activity_id"], 42);
    assert_eq!(body["name"], "Ride 42");

    let second = get(&app, "/api/activities/42", Some(&token)).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    assert!(second.headers().get("x-ratelimit-remaining").is_none());
    assert_eq!(second.headers().get(header::ETAG).unwrap(), etag.as_str());
}

#[tokio::test]
async fn test_matching_etag_returns_not_modified() {
    let server = MockServer::start().await;
    mock_activity(&server, 42, 1).await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;
    let token = common::create_test_jwt(7, "free");

    let first = get(&app, "/api/activities/42", Some(&token)).await;
    let etag = first.headers().get(header::ETAG).unwrap().clone();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/activities/42")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(header::IF_NONE_MATCH, etag.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers().get(header::ETAG).unwrap(), &etag);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_exhausted_tier_returns_429_with_retry_after() {
    let server = MockServer::start().await;
    mock_activity(&server, 1, 1).await;
    mock_activity(&server, 2, 0).await;

    let mut config = Config::test_default();
    config.strava_api_url = format!("{}/api/v3", server.uri());
    config.tier_limits = TierLimits::new(BTreeMap::from([("free".to_string(), 1)]));
    let app = common::create_test_app_with(config);
    common::seed_credentials(&app, 7).await;
    let token = common::create_test_jwt(7, "free");

    let first = get(&app, "/api/activities/1", Some(&token)).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-ratelimit-remaining").unwrap(), "0");

    // Cache hits do not consume the budget.
    let cached = get(&app, "/api/activities/1", Some(&token)).await;
    assert_eq!(cached.status(), StatusCode::OK);

    let denied = get(&app, "/api/activities/2", Some(&token)).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(denied.headers().get(header::RETRY_AFTER).is_some());
    let body = json_body(denied).await;
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["reason"], "tier_quota_exceeded:free:hour");
}

#[tokio::test]
async fn test_unknown_activity_is_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/activities/9"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;

    let response = get(
        &app,
        "/api/activities/9",
        Some(&common::create_test_jwt(7, "free")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_provider_failure_is_502() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/activities/9"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal detail"))
        .mount(&server)
        .await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;

    let response = get(
        &app,
        "/api/activities/9",
        Some(&common::create_test_jwt(7, "free")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["reason"], "provider_error");
}

#[tokio::test]
async fn test_reads_fail_open_when_store_is_down() {
    let server = MockServer::start().await;
    mock_activity(&server, 42, 1).await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;
    app.store.set_offline(true);

    let response = get(
        &app,
        "/api/activities/42",
        Some(&common::create_test_jwt(7, "free")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_streams_are_cached_and_filtered() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/activities/42/streams"))
        .and(query_param("keys", "watts,heartrate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "watts": {"data": [150, 210]},
            "heartrate": {"data": [120, 131]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;
    let token = common::create_test_jwt(7, "pro");

    let first = get(
        &app,
        "/api/activities/42/streams?keys=watts,heartrate",
        Some(&token),
    )
    .await;
    assert_eq!(first.status(), StatusCode::OK);
    let body = json_body(first).await;
    assert_eq!(body["watts"]["data"][1], 210);

    let second = get(&app, "/api/activities/42/streams?keys=watts", Some(&token)).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    let body = json_body(second).await;
    assert!(body.get("heartrate").is_none());
    assert_eq!(body["watts"]["data"][0], 150);
}

#[tokio::test]
async fn test_missing_stream_types_are_cached_as_absent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/activities/42/streams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "watts": {"data": [150, 210]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;
    let token = common::create_test_jwt(7, "pro");

    for i in 0..5 {
        let response = get(
            &app,
            "/api/activities/42/streams?keys=watts,heartrate",
            Some(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let expected = if i == 0 { "MISS" } else { "HIT" };
        assert_eq!(response.headers().get("x-cache").unwrap(), expected);
        let body = json_body(response).await;
        assert!(body.get("heartrate").is_none());
        assert_eq!(body["watts"]["data"][0], 150);
    }
}

#[tokio::test]
async fn test_rejected_access_token_is_refreshed_and_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/activities/42"))
        .and(bearer_token("access-7"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/activities/42"))
        .and(bearer_token("rotated-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::strava_activity_json(42)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "rotated-access",
            "refresh_token": "rotated-refresh",
            "expires_at": common::TEST_NOW_MS / 1000 + 6 * 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    let app = common::create_test_app_for(&server.uri());
    common::seed_credentials(&app, 7).await;

    let response = get(
        &app,
        "/api/activities/42",
        Some(&common::create_test_jwt(7, "free")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = app.db.get_credentials(7).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "rotated-refresh");
}

#[tokio::test]
async fn test_rejected_refresh_on_read_deauthorizes_athlete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "message": "Bad Request",
            "errors": [{"resource": "RefreshToken", "code": "invalid"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let app = common::create_test_app_for(&server.uri());
    app.db
        .set_credentials(&AthleteCredential {
            athlete_id: 7,
            access_token: "stale".to_string(),
            refresh_token: "revoked".to_string(),
            expires_at: common::now(&app.clock) - chrono::Duration::minutes(1),
            scopes: vec![],
        })
        .await
        .unwrap();

    let response = get(
        &app,
        "/api/activities/42",
        Some(&common::create_test_jwt(7, "free")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"], "credentials_invalid");

    assert!(app.db.get_credentials(7).await.unwrap().is_none());
    assert!(app
        .db
        .audit_entries()
        .iter()
        .any(|e| e.kind == AuditKind::Deauth && e.athlete_id == Some(7)));
}

#[tokio::test]
async fn test_invalid_stream_keys_are_rejected() {
    let app = common::create_test_app();
    let token = common::create_test_jwt(7, "free");

    let response = get(&app, "/api/activities/42/streams?keys=watts,bogus", Some(&token)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&app, "/api/activities/42/streams", Some(&token)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sync_request_queues_reconcile() {
    let app = common::create_test_app();
    let token = common::create_test_jwt(7, "free");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sync?since=1772000000")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["queued"], true);
    assert_eq!(body["since"], 1_772_000_000);
    assert_eq!(body["queue_len"], 1);

    match app.state.queue.pop(Lane::Live).await.unwrap() {
        Some(Dequeued::Job(envelope)) => assert_eq!(
            envelope.job,
            Job::reconcile(7, 1_772_000_000)
        ),
        other => panic!("expected reconcile job, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sync_request_defaults_to_one_week() {
    let app = common::create_test_app();
    let token = common::create_test_jwt(7, "free");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sync")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(
        body["since"],
        common::TEST_NOW_MS / 1000 - 7 * 24 * 60 * 60
    );
}

#[tokio::test]
async fn test_sync_request_rejects_future_and_outage() {
    let app = common::create_test_app();
    let token = common::create_test_jwt(7, "free");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sync?since=4000000000")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Sync fails closed when budgets cannot be counted.
    app.store.set_offline(true);
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sync")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_security_headers_on_api_errors() {
    let app = common::create_test_app();
    let response = get(&app, "/api/activities/1", None).await;

    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
}
