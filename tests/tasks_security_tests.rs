// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Security and behavior tests for maintenance task handlers.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use tower::ServiceExt;
use velo_sync::middleware::tasks_auth::TASK_SECRET_HEADER;
use velo_sync::models::{AuditKind, AuditLogEntry};
use velo_sync::services::queue::{Job, Lane};
use velo_sync::store::KvStore;

mod common;

async fn call(app: &common::TestApp, method: &str, uri: &str, secret: Option<&str>) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(secret) = secret {
        builder = builder.header(TASK_SECRET_HEADER, secret);
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

#[tokio::test]
async fn test_tasks_without_secret_forbidden() {
    let app = common::create_test_app();

    for (method, uri) in [
        ("POST", "/tasks/drain"),
        ("POST", "/tasks/drain-batch"),
        ("POST", "/tasks/prune-audit"),
        ("GET", "/tasks/dead-letters"),
        ("POST", "/tasks/dead-letters/redrive"),
        ("GET", "/tasks/usage"),
    ] {
        let response = call(&app, method, uri, None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{} {}", method, uri);
    }
}

#[tokio::test]
async fn test_tasks_wrong_secret_forbidden() {
    let app = common::create_test_app();
    let response = call(&app, "GET", "/tasks/usage", Some("test_task_secreT")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_tasks_empty_configured_secret_blocks_everything() {
    let mut config = velo_sync::config::Config::test_default();
    config.task_secret = String::new();
    let app = common::create_test_app_with(config);

    let response = call(&app, "GET", "/tasks/usage", Some("")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_drain_with_secret_reports() {
    let app = common::create_test_app();
    app.state
        .queue
        .enqueue(Lane::Live, Job::Deauth { athlete_id: 3 })
        .await
        .unwrap();

    let response = call(&app, "POST", "/tasks/drain", Some("test_task_secret")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["processed"], 1);
    assert_eq!(body["deferred"], 0);
}

#[tokio::test]
async fn test_usage_reports_queues_and_aggregate() {
    let app = common::create_test_app();
    app.state
        .queue
        .enqueue(Lane::Batch, Job::Deauth { athlete_id: 3 })
        .await
        .unwrap();
    app.state
        .limiter
        .check_provider(
            "strava",
            3,
            velo_sync::services::rate_limit::StoreErrorPolicy::FailOpen,
        )
        .await
        .unwrap();

    let response = call(&app, "GET", "/tasks/usage", Some("test_task_secret")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["provider"], "strava");
    assert_eq!(body["queues"]["batch"], 1);
    assert_eq!(body["queues"]["live"], 0);
    assert_eq!(body["aggregate"]["15min"], 1);
    assert_eq!(body["aggregate"]["day"], 1);
    assert_eq!(body["pending_ttls"], 0);
}

#[tokio::test]
async fn test_dead_letters_list_and_redrive() {
    let app = common::create_test_app();
    let key = app.state.queue.lane_key(Lane::Live);
    app.store.rpush(&key, "garbage").await.unwrap();
    app.state
        .queue
        .dead_letter(
            Lane::Backfill,
            r#"{"job":{"kind":"deauth","athlete_id":4},"attempts":3,"enqueued_at":0}"#,
            "provider unavailable",
        )
        .await
        .unwrap();

    let response = call(&app, "POST", "/tasks/drain", Some("test_task_secret")).await;
    assert_eq!(json_body(response).await["malformed"], 1);

    let response = call(&app, "GET", "/tasks/dead-letters?limit=10", Some("test_task_secret")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["letters"][0]["lane"], "backfill");
    assert_eq!(body["letters"][1]["raw"], "garbage");

    let response = call(
        &app,
        "POST",
        "/tasks/dead-letters/redrive",
        Some("test_task_secret"),
    )
    .await;
    let body = json_body(response).await;
    assert_eq!(body["redriven"], 1);
    assert_eq!(body["kept"], 1);
    assert_eq!(app.state.queue.len(Lane::Backfill).await.unwrap(), 1);
}

#[tokio::test]
async fn test_prune_audit_removes_old_entries() {
    let app = common::create_test_app();
    let now = common::now(&app.clock);
    let db: &dyn velo_sync::db::Persistence = &app.db;
    db.append_audit_log(
        &AuditLogEntry::new(AuditKind::Sync, "1", "old").at(now - chrono::Duration::days(45)),
    )
    .await
    .unwrap();
    db.append_audit_log(
        &AuditLogEntry::new(AuditKind::Sync, "2", "recent").at(now - chrono::Duration::days(2)),
    )
    .await
    .unwrap();

    let response = call(&app, "POST", "/tasks/prune-audit", Some("test_task_secret")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["removed"], 1);

    let remaining = app.db.audit_entries();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].ref_id, "2");
}
