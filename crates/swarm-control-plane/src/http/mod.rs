// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface: two axum listeners sharing one application state.
//!
//! The public listener carries the drone protocol and the read-only
//! endpoints; its write routes require the admin key. The admin listener
//! carries everything and requires the key on every route. Both wrap
//! their routers in the protocol-capture middleware (one log row per
//! completed exchange) and a request timeout that answers 504.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use swarm_core::types::now_ts;
use swarm_core::{Config, EventBus, Store};

use crate::health::HealthMonitor;
use crate::link::LinkRunner;
use crate::payloads::PayloadManager;
use crate::protocol_log::{Exchange, ProtocolLogger};
use crate::releases::ReleaseManager;
use crate::scheduler::Scheduler;
use crate::self_healing::SelfHealingMonitor;

pub mod admin;
pub mod error;
pub mod public;

use error::{ApiError, ErrorBody};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// State store.
    pub store: Store,
    /// Configuration.
    pub config: Arc<Config>,
    /// Event bus.
    pub events: EventBus,
    /// Scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Circuit breaker.
    pub health: Arc<HealthMonitor>,
    /// Self-healing monitor.
    pub healer: Arc<SelfHealingMonitor>,
    /// Payload registry.
    pub payloads: Arc<PayloadManager>,
    /// Release manager.
    pub releases: Arc<ReleaseManager>,
    /// Remote command transport (log tails).
    pub link: Arc<dyn LinkRunner>,
    /// Protocol capture handle.
    pub protocol: ProtocolLogger,
    /// Shared admin secret.
    pub admin_key: Arc<String>,
    /// Startup time for uptime reporting.
    pub started_at: f64,
}

impl AppState {
    /// Seconds since startup.
    pub fn uptime_s(&self) -> f64 {
        now_ts() - self.started_at
    }
}

/// Build the public-port router.
pub fn public_router(state: AppState) -> Router {
    let writes = admin_gated_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        require_admin,
    ));

    Router::new()
        .route("/api/v1/health", get(public::health))
        .route("/api/v1/status", get(public::status))
        .route("/api/v1/nodes", get(public::nodes))
        .route("/api/v1/events", get(public::events))
        .route("/api/v1/events/history", get(public::events_history))
        .route("/api/v1/history", get(public::history))
        .route("/api/v1/sessions", get(public::sessions))
        .route("/api/v1/drone-health", get(public::drone_health))
        .route("/api/v1/queue", get(public::queue_listing))
        .route("/api/v1/register", post(public::register))
        .route("/api/v1/work", get(public::work))
        .route("/api/v1/complete", post(public::complete))
        .merge(writes)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            capture_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(handle_timeout))
                .layer(tower::timeout::TimeoutLayer::new(
                    state.config.request_timeout,
                )),
        )
        .with_state(state)
}

/// Build the admin-port router. Every route requires the admin key.
pub fn admin_router(state: AppState) -> Router {
    let routes = admin_gated_routes()
        .route("/admin/api/system/info", get(admin::system_info))
        .route("/admin/api/protocol", get(admin::protocol_entries))
        .route("/admin/api/protocol/stats", get(admin::protocol_stats))
        .route("/admin/api/protocol/density", get(admin::protocol_density))
        .route("/admin/api/protocol/snapshot", get(admin::protocol_snapshot))
        .route("/admin/api/protocol/{id}", get(admin::protocol_detail))
        .route("/admin/api/payloads", get(admin::list_payloads).post(admin::register_payload))
        .route("/admin/api/payloads/status", get(admin::payload_status))
        .route("/admin/api/payloads/{kind}/versions", get(admin::payload_versions))
        .route("/admin/api/payloads/{kind}/verify", post(admin::verify_payload))
        .route(
            "/admin/api/payloads/{kind}/{version}/deploy",
            post(admin::deploy_payload),
        )
        .route(
            "/admin/api/payloads/{kind}/{version}/rolling-deploy",
            post(admin::rolling_deploy),
        )
        .route("/admin/api/releases", get(admin::list_releases).post(admin::create_release))
        .route("/admin/api/releases/diff", get(admin::diff_releases))
        .route("/admin/api/releases/rollback", post(admin::rollback_release))
        .route("/admin/api/releases/binhost", get(admin::binhost_status))
        .route(
            "/admin/api/releases/{version}",
            get(admin::get_release).delete(admin::delete_release),
        )
        .route("/admin/api/releases/{version}/packages", get(admin::release_packages))
        .route("/admin/api/releases/{version}/promote", post(admin::promote_release))
        .route("/admin/api/releases/{version}/archive", post(admin::archive_release))
        .route("/admin/api/drone-configs", get(admin::list_drone_configs))
        .route(
            "/admin/api/drone-config/{name}",
            get(admin::get_drone_config)
                .post(admin::upsert_drone_config)
                .delete(admin::delete_drone_config),
        )
        .route("/admin/api/logs/control-plane", get(admin::control_plane_log))
        .route("/admin/api/drones/{name}/syslog", get(admin::drone_syslog))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    Router::new()
        .merge(routes)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            capture_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(handle_timeout))
                .layer(tower::timeout::TimeoutLayer::new(
                    state.config.request_timeout,
                )),
        )
        .with_state(state)
}

/// Write/control routes shared by both listeners; the caller attaches
/// the auth middleware.
fn admin_gated_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/queue", post(admin::submit_queue))
        .route("/api/v1/control", post(admin::control))
        .route("/api/v1/nodes/{name}/pause", post(admin::pause_node))
        .route("/api/v1/nodes/{name}/resume", post(admin::resume_node))
        .route("/api/v1/nodes/{name}/ping", post(admin::ping_node))
        .route(
            "/api/v1/nodes/{name}/reset-escalation",
            post(admin::reset_escalation),
        )
        .route("/api/v1/nodes/{name}/set-type", post(admin::set_node_type))
        .route("/api/v1/nodes/{name}", delete(admin::delete_node))
        .route("/api/v1/ping", get(admin::ping_one))
        .route("/api/v1/ping/all", get(admin::ping_all))
        .route("/api/v1/escalation", get(admin::escalation))
        .route("/api/v1/sql/tables", get(admin::sql_tables))
        .route("/api/v1/sql/schema", get(admin::sql_schema))
        .route("/api/v1/sql/query", get(admin::sql_query))
}

async fn handle_timeout(_err: tower::BoxError) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::GATEWAY_TIMEOUT,
        Json(ErrorBody {
            error: "Request deadline exceeded".to_string(),
            hint: None,
        }),
    )
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}

/// Admin-key gate. Constant-time comparison; missing or wrong key is 401.
async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected = state.admin_key.as_bytes();
    let ok = provided.len() == expected.len()
        && provided.as_bytes().ct_eq(expected).unwrap_u8() == 1;
    if !ok {
        return ApiError::Auth.into_response();
    }
    next.run(request).await
}

/// Capture middleware: buffer both bodies, time the handler, then hand
/// the completed exchange to the protocol logger.
async fn capture_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let source_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let (parts, body) = request.into_parts();
    let request_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::validation("unreadable request body").into_response();
        }
    };
    let request_body = (!request_bytes.is_empty())
        .then(|| String::from_utf8_lossy(&request_bytes).into_owned());
    let request = Request::from_parts(parts, Body::from(request_bytes));

    let response = next.run(request).await;

    let status = response.status();
    let (parts, body) = response.into_parts();
    let response_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let response_body = (!response_bytes.is_empty())
        .then(|| String::from_utf8_lossy(&response_bytes).into_owned());
    let response = Response::from_parts(parts, Body::from(response_bytes));

    state.protocol.log_exchange(Exchange {
        source_ip,
        method,
        path,
        request_body,
        response_body,
        status_code: status.as_u16(),
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
    });

    response
}

/// Best-effort primary IP of this host, for register responses.
pub fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("10.255.255.255:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
