//! Tests for the REST API module

use crate::api::{create_router, AppState};
use crate::store::Store;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::json;
use shared::api::{endpoints, headers, RegisterTaskResponse};
use shared::config::CoordinatorConfig;
use shared::{Owner, TaskKind, TaskStatus};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::ServiceExt; // for `oneshot`

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        bind_address: "127.0.0.1:0".to_string(),
        db_path: ":memory:".to_string(),
        plugins_dir: "./plugins".to_string(),
        assignment_interval_seconds: 2,
        retention_days: 30,
        retention_sweep_interval_seconds: 3600,
        wal_checkpoint_interval_seconds: 60,
        database_busy_timeout_seconds: 30,
        graceful_shutdown_timeout_seconds: 30,
        http_body_limit_mb: 16,
        idle_after_seconds: 60,
        offline_after_seconds: 300,
        admin_users: vec!["root".to_string()],
    }
}

async fn create_test_app() -> (axum::Router, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("octopus.db");

    let mut store = Store::new(&db_path).unwrap();
    store.initialize().unwrap();

    let state = AppState::new(test_config(), Arc::new(Mutex::new(store)));
    (create_router(state), temp_dir)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _dir) = create_test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_and_list_task() {
    let (app, _dir) = create_test_app().await;

    let register = json!({
        "name": "nightly-backup",
        "kind": "adhoc",
        "owner": "ANYONE",
        "plugin": "backup",
        "action": "run",
        "args": [],
        "kwargs": {}
    });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(endpoints::TASKS)
                .header("content-type", "application/json")
                .body(Body::from(register.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: RegisterTaskResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(body.task.name, "nightly-backup");
    assert_eq!(body.task.owner, Owner::Anyone);
    assert_eq!(body.task.kind, TaskKind::Adhoc);
    assert_eq!(body.task.status, TaskStatus::Created);

    let list_response = app
        .oneshot(
            Request::builder()
                .uri(endpoints::TASKS)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(list_response.status(), StatusCode::OK);
    let tasks = body_json(list_response).await;
    assert!(tasks.as_object().unwrap().contains_key(&body.task.id));
}

#[tokio::test]
async fn test_client_tasks_filters_by_hostname_and_active_status() {
    let (app, _dir) = create_test_app().await;

    let register = json!({
        "name": "ping-sweep",
        "kind": "adhoc",
        "owner": "worker-01",
        "plugin": "net",
        "action": "ping",
    });
    app.clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(endpoints::TASKS)
                .header("content-type", "application/json")
                .body(Body::from(register.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    // Newly created tasks start in `created`, not `active`, so they are not
    // yet visible to any worker until an assignment pass runs.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/client-tasks/worker-01")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tasks"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_trigger_assignment_assigns_all_owner_task() {
    let (app, _dir) = create_test_app().await;

    let register = json!({
        "name": "broadcast-restart",
        "kind": "adhoc",
        "owner": "ALL",
        "plugin": "svc",
        "action": "restart",
    });
    app.clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(endpoints::TASKS)
                .header("content-type", "application/json")
                .body(Body::from(register.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(endpoints::TASKS_ASSIGN)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "force": true }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "assigned");
    assert_eq!(body["assigned_after"], 1);
}

#[tokio::test]
async fn test_delete_task_not_found() {
    let (app, _dir) = create_test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/tasks/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_heartbeat_rejects_invalid_hostname() {
    let (app, _dir) = create_test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(endpoints::HEARTBEAT)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "hostname": "" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_heartbeat_then_commands_round_trip() {
    let (app, _dir) = create_test_app().await;

    let hb = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(endpoints::HEARTBEAT)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "hostname": "worker-01" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(hb.status(), StatusCode::OK);

    let enqueue = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/commands/worker-01")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "action": "reload" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(enqueue.status(), StatusCode::OK);

    let drained = app
        .oneshot(
            Request::builder()
                .uri("/commands/worker-01")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(drained.status(), StatusCode::OK);
    let body = body_json(drained).await;
    assert_eq!(body["commands"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_user_profile_requires_matching_username_header() {
    let (app, _dir) = create_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/cache/user/alice/profile")
                .header(headers::USERNAME, "bob")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_user_param_requires_owner_or_admin() {
    let (app, _dir) = create_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/user-params/alice/theme?requester=mallory")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_user_param_set_and_get_by_owner() {
    let (app, _dir) = create_test_app().await;

    let set = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/user-params/alice/theme")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "requester": "alice", "value": "dark" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(set.status(), StatusCode::OK);

    let get = app
        .oneshot(
            Request::builder()
                .uri("/api/user-params/alice/theme?requester=alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::OK);
    let body = body_json(get).await;
    assert_eq!(body["parameter"]["value"], "dark");
}
