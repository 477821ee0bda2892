// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests over the HTTP routers with an in-memory store and a
//! scripted SSH mock.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use swarm_control_plane::health::HealthMonitor;
use swarm_control_plane::http::{admin_router, public_router, AppState};
use swarm_control_plane::link::mock::MockRunner;
use swarm_control_plane::payloads::PayloadManager;
use swarm_control_plane::protocol_log::ProtocolLogger;
use swarm_control_plane::releases::ReleaseManager;
use swarm_control_plane::scheduler::Scheduler;
use swarm_control_plane::self_healing::SelfHealingMonitor;

use swarm_core::types::now_ts;
use swarm_core::{Config, EventBus, Store};

const ADMIN_KEY: &str = "test-admin-key";

struct TestApp {
    public: Router,
    admin: Router,
    store: Store,
}

async fn test_app() -> TestApp {
    test_app_with(Config::default()).await
}

async fn test_app_with(config: Config) -> TestApp {
    let store = Store::open_in_memory().await.unwrap();
    let config = Arc::new(config);
    let (events, _event_writer) = EventBus::new(store.clone());
    let (protocol, _protocol_writer) = ProtocolLogger::new(store.clone());
    let link = Arc::new(MockRunner::new());

    let health = Arc::new(HealthMonitor::new(
        store.clone(),
        events.clone(),
        config.clone(),
        link.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        events.clone(),
        config.clone(),
        health.clone(),
    ));
    let healer = Arc::new(SelfHealingMonitor::new(
        store.clone(),
        events.clone(),
        config.clone(),
        link.clone(),
    ));
    let payloads = Arc::new(PayloadManager::new(
        store.clone(),
        events.clone(),
        config.clone(),
        link.clone(),
    ));
    let releases = Arc::new(ReleaseManager::new(
        store.clone(),
        events.clone(),
        config.clone(),
    ));

    let state = AppState {
        store: store.clone(),
        config,
        events,
        scheduler,
        health,
        healer,
        payloads,
        releases,
        link,
        protocol,
        admin_key: Arc::new(ADMIN_KEY.to_string()),
        started_at: now_ts(),
    };

    TestApp {
        public: public_router(state.clone()),
        admin: admin_router(state),
        store,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value, admin: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if admin {
        builder = builder.header("x-admin-key", ADMIN_KEY);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn register_body(id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "ip": "10.0.0.50",
        "type": "drone",
        "capabilities": {"cores": 16, "ram_gb": 64.0, "auto_reboot": true},
        "metrics": {"cpu_percent": 10.0, "ram_percent": 20.0, "load_1m": 0.5},
        "current_task": null,
        "version": "0.4.0",
    })
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = test_app().await;
    let (status, body) = send(&app.public, get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["uptime_s"].is_number());
}

#[tokio::test]
async fn happy_path_submit_work_complete() {
    let app = test_app().await;

    // Register the drone.
    let (status, body) = send(
        &app.public,
        post_json("/api/v1/register", register_body("d1", "drone-one"), false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "registered");
    assert_eq!(body["paused"], false);
    assert!(body["orchestrator_port"].is_number());

    // Admin submits one package.
    let (status, body) = send(
        &app.admin,
        post_json(
            "/api/v1/queue",
            json!({"packages": ["dev-libs/openssl-3.2.0"], "session_name": "t1"}),
            true,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], 1);
    let session_id = body["session_id"].as_str().unwrap().to_string();

    // Drone pulls work.
    let (status, body) = send(&app.public, get("/api/v1/work?id=d1&cores=16")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["package"], "=dev-libs/openssl-3.2.0");

    // Drone reports success.
    let (status, body) = send(
        &app.public,
        post_json(
            "/api/v1/complete",
            json!({
                "id": "d1",
                "package": "=dev-libs/openssl-3.2.0",
                "status": "success",
                "build_duration_s": 10.0,
            }),
            false,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["package"], "=dev-libs/openssl-3.2.0");

    // Queue row received; session closed with totals 1/1.
    let counts = app.store.queue_counts(None).await.unwrap();
    assert_eq!(counts.received, 1);

    let session = app.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, "completed");
    assert_eq!(session.total_packages, 1);
    assert_eq!(session.completed_packages, 1);

    let history = app.store.build_history(10, None, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "success");
}

#[tokio::test]
async fn stale_completion_still_answers_ok() {
    let app = test_app().await;
    send(
        &app.public,
        post_json("/api/v1/register", register_body("d1", "drone-one"), false),
    )
    .await;
    send(
        &app.admin,
        post_json("/api/v1/queue", json!({"packages": ["dev-libs/a-1.0"]}), true),
    )
    .await;
    send(&app.public, get("/api/v1/work?id=d1")).await;

    // Admin rebalance pulls the item back.
    let (status, _) = send(
        &app.admin,
        post_json("/api/v1/control", json!({"action": "rebalance"}), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The drone's late failure report is still answered with 200 ok.
    let (status, body) = send(
        &app.public,
        post_json(
            "/api/v1/complete",
            json!({"id": "d1", "package": "=dev-libs/a-1.0", "status": "failed",
                   "build_duration_s": 5.0, "error_detail": "boom"}),
            false,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    // Nothing recorded: still needed, no history.
    let counts = app.store.queue_counts(None).await.unwrap();
    assert_eq!(counts.needed, 1);
    assert!(app.store.build_history(10, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn write_endpoints_require_the_admin_key() {
    let app = test_app().await;

    // No key on the public port: 401.
    let (status, body) = send(
        &app.public,
        post_json("/api/v1/queue", json!({"packages": ["x/y-1.0"]}), false),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("Unauthorized"));

    // Wrong key on the admin port: 401.
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/control")
        .header("content-type", "application/json")
        .header("x-admin-key", "wrong")
        .body(Body::from(json!({"action": "pause"}).to_string()))
        .unwrap();
    let (status, _) = send(&app.admin, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Correct key on the public port works.
    let (status, _) = send(
        &app.public,
        post_json("/api/v1/queue", json!({"packages": ["x/y-1.0"]}), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_control_action_is_a_400_with_hint() {
    let app = test_app().await;
    let (status, body) = send(
        &app.admin,
        post_json("/api/v1/control", json!({"action": "explode"}), true),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Unknown action"));
    assert!(body["hint"].as_str().unwrap().contains("pause"));
}

#[tokio::test]
async fn unknown_completion_status_is_rejected() {
    let app = test_app().await;
    let (status, body) = send(
        &app.public,
        post_json(
            "/api/v1/complete",
            json!({"id": "d1", "package": "x/y-1.0", "status": "exploded"}),
            false,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["hint"].as_str().unwrap().contains("success"));
}

#[tokio::test]
async fn pause_blocks_work_until_resume() {
    let app = test_app().await;
    send(
        &app.public,
        post_json("/api/v1/register", register_body("d1", "drone-one"), false),
    )
    .await;
    send(
        &app.admin,
        post_json("/api/v1/queue", json!({"packages": ["x/y-1.0"]}), true),
    )
    .await;

    send(
        &app.admin,
        post_json("/api/v1/control", json!({"action": "pause"}), true),
    )
    .await;
    let (_, body) = send(&app.public, get("/api/v1/work?id=d1")).await;
    assert_eq!(body["package"], Value::Null);

    send(
        &app.admin,
        post_json("/api/v1/control", json!({"action": "resume"}), true),
    )
    .await;
    let (_, body) = send(&app.public, get("/api/v1/work?id=d1")).await;
    assert_eq!(body["package"], "=x/y-1.0");
}

#[tokio::test]
async fn node_actions_and_status_listing() {
    let app = test_app().await;
    send(
        &app.public,
        post_json("/api/v1/register", register_body("d1", "drone-one"), false),
    )
    .await;

    let (status, body) = send(
        &app.admin,
        post_json("/api/v1/nodes/drone-one/pause", json!({}), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paused");

    let (status, body) = send(
        &app.admin,
        post_json(
            "/api/v1/nodes/drone-one/set-type",
            json!({"drone_type": "container"}),
            true,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["drone_type"], "container");

    let (status, body) = send(
        &app.admin,
        post_json(
            "/api/v1/nodes/drone-one/set-type",
            json!({"drone_type": "mainframe"}),
            true,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["hint"].as_str().unwrap().contains("bare-metal"));

    let (status, body) = send(&app.public, get("/api/v1/nodes?all=true")).await;
    assert_eq!(status, StatusCode::OK);
    let nodes = body.as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["name"], "drone-one");
    assert_eq!(nodes[0]["kind"], "container");
    assert_eq!(nodes[0]["paused"], true);

    let (status, body) = send(
        &app.admin,
        post_json("/api/v1/nodes/ghost/pause", json!({}), true),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn events_tail_and_history_are_served() {
    let app = test_app().await;
    send(
        &app.public,
        post_json("/api/v1/register", register_body("d1", "drone-one"), false),
    )
    .await;

    let (status, body) = send(&app.public, get("/api/v1/events")).await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["event_type"] == "register"));

    let (status, body) = send(&app.public, get("/api/v1/events?type=register")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn sql_explorer_is_select_only() {
    let app = test_app().await;

    let (status, body) = send(
        &app.admin,
        Request::builder()
            .uri("/api/v1/sql/query?q=SELECT%20COUNT(*)%20FROM%20queue")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, _) = send(
        &app.admin,
        Request::builder()
            .uri("/api/v1/sql/query?q=DELETE%20FROM%20queue")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app.admin,
        Request::builder()
            .uri("/api/v1/sql/tables")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["tables"].as_array().unwrap().len() > 5);
}

#[tokio::test]
async fn payload_register_and_duplicate_conflict() {
    let app = test_app().await;

    use base64::Engine;
    let content = base64::engine::general_purpose::STANDARD.encode(b"drone-binary-bytes");
    let (status, body) = send(
        &app.admin,
        post_json(
            "/admin/api/payloads",
            json!({"kind": "drone_binary", "version": "v0.4.0", "content_base64": content}),
            true,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["kind"], "drone_binary");

    // Same version, different bytes: 409.
    let other = base64::engine::general_purpose::STANDARD.encode(b"different");
    let (status, _) = send(
        &app.admin,
        post_json(
            "/admin/api/payloads",
            json!({"kind": "drone_binary", "version": "v0.4.0", "content_base64": other}),
            true,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Bad base64: 400.
    let (status, _) = send(
        &app.admin,
        post_json(
            "/admin/api/payloads",
            json!({"kind": "drone_binary", "version": "v0.5.0", "content_base64": "!!!"}),
            true,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn release_lifecycle_over_http() {
    let dirs = tempfile::tempdir().unwrap();
    let staging = dirs.path().join("staging");
    std::fs::create_dir_all(staging.join("dev-libs")).unwrap();
    std::fs::write(staging.join("dev-libs/zlib-1.3.gpkg.tar"), b"bytes").unwrap();

    let config = Config {
        staging_path: staging,
        releases_path: dirs.path().join("releases"),
        binhost_symlink: dirs.path().join("binpkgs"),
        ..Config::default()
    };
    let app = test_app_with(config).await;

    let (status, body) = send(
        &app.admin,
        post_json("/admin/api/releases", json!({"version": "r1"}), true),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "staging");

    let (status, body) = send(
        &app.admin,
        post_json("/admin/api/releases/r1/promote", json!({}), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["release"]["status"], "active");

    // Promote again: no-op 200.
    let (status, body) = send(
        &app.admin,
        post_json("/admin/api/releases/r1/promote", json!({}), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["release"]["status"], "active");

    // Deleting the active release conflicts.
    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/api/releases/r1")
        .header("x-admin-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.admin, request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Archive, then delete works; row survives as deleted.
    send(
        &app.admin,
        post_json("/admin/api/releases/r1/archive", json!({}), true),
    )
    .await;
    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/api/releases/r1")
        .header("x-admin-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.admin, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app.admin,
        Request::builder()
            .uri("/admin/api/releases/r1")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn protocol_log_query_surface() {
    let app = test_app().await;
    send(
        &app.public,
        post_json("/api/v1/register", register_body("d1", "drone-one"), false),
    )
    .await;

    // Seed captured exchanges directly; the writer task is not running
    // under oneshot.
    let t0 = now_ts();
    let mut entries = Vec::new();
    for (offset, msg_type, body) in [
        (0.0, "status_query", Some(r#"{"needed": 3}"#)),
        (1.0, "work_request", None),
        (2.0, "work_request", None),
    ] {
        entries.push(swarm_core::store::protocol::ProtocolEntry {
            timestamp: t0 + offset,
            source_ip: Some("10.0.0.50".to_string()),
            method: "GET".to_string(),
            path: "/api/v1/status".to_string(),
            msg_type: msg_type.to_string(),
            drone_id: Some("d1".to_string()),
            status_code: 200,
            latency_ms: 5.0,
            response_body: body.map(str::to_string),
            ..Default::default()
        });
    }
    app.store.insert_protocol_entries(&entries).await.unwrap();

    let admin_get = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap()
    };

    // Entry listing with type filter; source_node resolved from the id.
    let (status, body) = send(&app.admin, admin_get("/admin/api/protocol?type=work_request")).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body["entries"].as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["source_node"], "drone-one");

    // Detail includes the captured body; unknown id is a 404.
    let first_id = body["entries"][0]["id"].as_i64().unwrap();
    let (status, body) = send(
        &app.admin,
        admin_get(&format!("/admin/api/protocol/{}", first_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg_type"], "work_request");
    let (status, _) = send(&app.admin, admin_get("/admin/api/protocol/999999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Stats group by type.
    let (status, body) = send(&app.admin, admin_get("/admin/api/protocol/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["by_type"][0]["msg_type"], "work_request");
    assert_eq!(body["by_type"][0]["count"], 2);

    // Density over an explicit window.
    let (status, body) = send(
        &app.admin,
        admin_get(&format!(
            "/admin/api/protocol/density?start={}&end={}&buckets=4",
            t0,
            t0 + 4.0
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let density = body["density"].as_array().unwrap();
    assert_eq!(density.len(), 4);
    assert_eq!(density.iter().filter_map(|v| v.as_i64()).sum::<i64>(), 3);

    // Snapshot replays the captured status response.
    let (status, body) = send(
        &app.admin,
        admin_get(&format!("/admin/api/protocol/snapshot?at={}", t0 + 10.0)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["needed"], 3);

    // Like every admin route, the surface is key-gated.
    let (status, _) = send(&app.admin, get("/admin/api/protocol")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let app = test_app().await;
    let (status, body) = send(&app.public, get("/api/v1/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not found");
}
