// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public-port handlers: drone protocol and read-only queries.

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use swarm_core::store::nodes::NodeRegistration;
use swarm_core::types::{AssignResult, Capabilities, CompletionStatus, Metrics};

use super::error::{ApiError, ApiResult};
use super::{local_ip, AppState};

const ORCHESTRATOR_NAME: &str = "swarm-control-plane";

// ── Drone protocol ────────────────────────────────────────────────────

/// Register/heartbeat body.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Stable drone id.
    pub id: String,
    /// Unique drone name.
    #[serde(default)]
    pub name: Option<String>,
    /// Self-reported address.
    #[serde(default)]
    pub ip: Option<String>,
    /// drone or sweeper.
    #[serde(default, rename = "type")]
    pub node_type: Option<String>,
    /// Capability set.
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Current metrics.
    #[serde(default)]
    pub metrics: Metrics,
    /// Package currently being built.
    #[serde(default)]
    pub current_task: Option<String>,
    /// Agent version.
    #[serde(default)]
    pub version: Option<String>,
}

/// `POST /api/v1/register`
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<Json<Value>> {
    if body.id.is_empty() {
        return Err(ApiError::validation("Missing node ID"));
    }

    let name = body
        .name
        .clone()
        .unwrap_or_else(|| format!("unknown-{}", body.id.chars().take(8).collect::<String>()));
    let node_type = match body.node_type.as_deref() {
        Some("sweeper") => "sweeper",
        _ if name
            .to_lowercase()
            .starts_with(&state.config.sweeper_prefix.to_lowercase()) =>
        {
            "sweeper"
        }
        _ => "drone",
    };

    let previous_status = state
        .store
        .upsert_node(&NodeRegistration {
            id: body.id.clone(),
            name: name.clone(),
            ip: body.ip.clone(),
            node_type: node_type.to_string(),
            capabilities: body.capabilities.clone(),
            metrics: body.metrics.clone(),
            current_task: body.current_task.clone(),
            version: body.version.clone(),
        })
        .await?;

    // A heartbeat naming one of this drone's own delegated packages
    // proves the build actually started.
    if let Some(task) = body.current_task.as_deref() {
        let _ = state.store.mark_building(task, &body.id).await;
    }

    if previous_status.as_deref() != Some("online") {
        let cores = body.capabilities.cores;
        state.events.publish(
            "register",
            match cores {
                Some(cores) => format!("{name} came online ({cores} cores)"),
                None => format!("{name} came online"),
            },
            Some(json!({ "ip": body.ip, "cores": cores })),
            Some(&name),
            None,
        );
    }

    let node = state.store.get_node(&body.id).await?;
    let paused = node.map(|n| n.is_paused()).unwrap_or(false);
    let orchestrator = state
        .config
        .report_ip
        .clone()
        .unwrap_or_else(local_ip);

    Ok(Json(json!({
        "status": "registered",
        "orchestrator": orchestrator,
        "orchestrator_port": state.config.public_port,
        "orchestrator_name": ORCHESTRATOR_NAME,
        "paused": paused,
    })))
}

/// `GET /api/v1/work` query.
#[derive(Debug, Deserialize)]
pub struct WorkQuery {
    /// Requesting drone id.
    #[serde(default)]
    pub id: Option<String>,
    /// Advertised cores (informational).
    #[serde(default)]
    #[allow(dead_code)]
    pub cores: Option<i64>,
}

/// `GET /api/v1/work?id=<drone_id>&cores=<n>`
pub async fn work(
    State(state): State<AppState>,
    Query(query): Query<WorkQuery>,
) -> ApiResult<Json<Value>> {
    let Some(id) = query.id else {
        return Err(ApiError::validation_with_hint(
            "Missing drone id",
            "use /api/v1/work?id=<drone_id>",
        ));
    };
    let result = state.scheduler.get_work(&id).await?;
    let package = match result {
        AssignResult::Assigned(package) => Some(package),
        AssignResult::Empty | AssignResult::Rejected(_) => None,
    };
    Ok(Json(json!({ "package": package })))
}

/// Completion report body.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    /// Reporting drone id.
    pub id: String,
    /// Package atom.
    pub package: String,
    /// success / failed / returned / upload_failed.
    pub status: String,
    /// Build wall time.
    #[serde(default)]
    pub build_duration_s: f64,
    /// Failure detail.
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// `POST /api/v1/complete`
///
/// Always answers `{status:"ok", package}` for well-formed reports, even
/// when the report is discarded as stale: drones retry on anything
/// else, and a stale report needs no retry.
pub async fn complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult<Json<Value>> {
    if body.package.is_empty() {
        return Err(ApiError::validation("Missing package"));
    }
    let Some(status) = CompletionStatus::parse(&body.status) else {
        return Err(ApiError::validation_with_hint(
            format!("Unknown status: {}", body.status),
            "expected success, failed, returned or upload_failed",
        ));
    };

    state
        .scheduler
        .complete(
            &body.id,
            &body.package,
            status,
            body.build_duration_s,
            body.error_detail.as_deref(),
        )
        .await?;

    Ok(Json(json!({ "status": "ok", "package": body.package })))
}

// ── Read-only endpoints ───────────────────────────────────────────────

/// `GET /api/v1/health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": (state.uptime_s() * 10.0).round() / 10.0,
    }))
}

/// `GET /api/v1/status`
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let counts = state.store.queue_counts(None).await?;
    let session = state.store.active_session().await?;
    let nodes = state.store.list_nodes(true).await?;
    let paused = state.store.is_paused().await?;
    let stats = state
        .store
        .build_stats(session.as_ref().map(|s| s.id.as_str()))
        .await?;

    let mut drone_status = BTreeMap::new();
    let mut drone_health = BTreeMap::new();
    for node in &nodes {
        drone_status.insert(
            node.name.clone(),
            json!({
                "name": node.name,
                "ip": node.ip,
                "status": node.status,
                "kind": node.kind,
                "paused": node.is_paused(),
                "current_task": node.current_task,
                "capabilities": node.capabilities(),
                "metrics": node.metrics(),
                "last_seen": node.last_seen,
            }),
        );
        let health = state.store.drone_health(&node.id).await?;
        if health.failures > 0 || health.escalation_level > 0 {
            drone_health.insert(node.name.clone(), health);
        }
    }

    let needed: Vec<String> = state
        .store
        .queue_items("needed", 10)
        .await?
        .into_iter()
        .map(|i| i.package)
        .collect();
    let mut delegated = BTreeMap::new();
    for item in state.store.delegated_items(None).await? {
        let drone = match item.assigned_to.as_deref() {
            Some(id) => state.store.drone_name(id).await,
            None => String::new(),
        };
        delegated.insert(
            item.package.clone(),
            json!({ "drone": drone, "assigned_at": item.assigned_at }),
        );
    }
    let blocked: Vec<String> = state
        .store
        .queue_items("blocked", 100)
        .await?
        .into_iter()
        .map(|i| i.package)
        .collect();

    let online = nodes.iter().filter(|n| n.is_online()).count();
    let total_cores: i64 = nodes.iter().filter_map(|n| n.cores).sum();

    Ok(Json(json!({
        "needed": counts.needed,
        "delegated": counts.delegated,
        "received": counts.received,
        "blocked": counts.blocked,
        "failed": counts.failed,
        "total": counts.total,
        "nodes": nodes.len(),
        "nodes_online": online,
        "total_cores": total_cores,
        "paused": paused,
        "session": session,
        "packages": {
            "needed": needed,
            "delegated": delegated,
            "blocked": blocked,
        },
        "drones": drone_status,
        "drone_health": drone_health,
        "timing": stats,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// `GET /api/v1/nodes` query.
#[derive(Debug, Deserialize)]
pub struct NodesQuery {
    /// Include offline nodes.
    #[serde(default)]
    pub all: Option<bool>,
}

/// `GET /api/v1/nodes[?all=true]`
pub async fn nodes(
    State(state): State<AppState>,
    Query(query): Query<NodesQuery>,
) -> ApiResult<Json<Value>> {
    let nodes = state
        .store
        .list_nodes(query.all.unwrap_or(false))
        .await?;

    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let metrics = node.metrics();
        let (ok, fail) = state.store.drone_build_counts(&node.id).await?;
        out.push(json!({
            "id": node.id,
            "name": node.name,
            "ip": node.ip,
            "kind": node.kind,
            "type": node.node_type,
            "cores": node.cores,
            "ram_gb": node.ram_gb,
            "status": node.status,
            "paused": node.is_paused(),
            "last_seen": node.last_seen,
            "current_task": node.current_task,
            "version": node.version,
            "cpu_percent": metrics.cpu_percent.unwrap_or(0.0),
            "ram_percent": metrics.ram_percent.unwrap_or(0.0),
            "load_1m": metrics.load_1m,
            "builds_completed": ok,
            "builds_failed": fail,
            "ping_latency_ms": node.ping_latency_ms,
        }));
    }
    Ok(Json(Value::Array(out)))
}

/// Ring tail query.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Return events with id greater than this.
    #[serde(default)]
    pub since: Option<u64>,
    /// Filter by kind.
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    /// Maximum events returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /api/v1/events[?limit&since&type]`
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    let (events, latest_id) = state.events.tail(
        query.since.unwrap_or(0),
        query.event_type.as_deref(),
        query.limit.unwrap_or(200),
    );
    Json(json!({ "events": events, "latest_id": latest_id }))
}

/// Persistent history query.
#[derive(Debug, Deserialize)]
pub struct EventHistoryQuery {
    /// Events newer than this timestamp.
    #[serde(default)]
    pub since: Option<f64>,
    /// Filter by kind.
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    /// Filter by drone name.
    #[serde(default)]
    pub drone: Option<String>,
    /// Maximum events returned.
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /api/v1/events/history[?limit&since&type&drone]`
pub async fn events_history(
    State(state): State<AppState>,
    Query(query): Query<EventHistoryQuery>,
) -> ApiResult<Json<Value>> {
    let events = state
        .store
        .event_history(
            query.since,
            query.event_type.as_deref(),
            query.drone.as_deref(),
            query.limit.unwrap_or(500).min(5000),
        )
        .await?;
    Ok(Json(json!({ "total": events.len(), "events": events })))
}

/// Build-history query.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Maximum rows returned.
    #[serde(default)]
    pub limit: Option<i64>,
    /// Filter by completion status.
    #[serde(default)]
    pub status: Option<String>,
    /// Filter by drone id or name.
    #[serde(default)]
    pub drone: Option<String>,
}

/// `GET /api/v1/history[?limit&status&drone]`
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .store
        .build_history(
            query.limit.unwrap_or(100).min(5000),
            query.status.as_deref(),
            query.drone.as_deref(),
        )
        .await?;
    let stats = state.store.build_stats(None).await?;
    Ok(Json(json!({ "history": rows, "stats": stats })))
}

/// `GET /api/v1/sessions`
pub async fn sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.store.list_sessions(50).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// `GET /api/v1/drone-health`
pub async fn drone_health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let nodes = state.store.list_nodes(true).await?;
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let health = state.store.drone_health(&node.id).await?;
        let probe: Value = health
            .last_probe_result
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or(Value::Null);
        out.push(json!({
            "drone": node.name,
            "ip": node.ip,
            "status": node.status,
            "kind": node.kind,
            "failures": health.failures,
            "grounded_until": health.grounded_until,
            "rebooted": health.rebooted,
            "last_failure": health.last_failure,
            "upload_failures": health.upload_failures,
            "escalation_level": health.escalation_level,
            "last_probe": probe,
            "last_probe_at": health.last_probe_at,
        }));
    }
    Ok(Json(json!({ "drones": out })))
}

/// Queue listing row shape for the dashboard.
#[derive(Debug, Serialize)]
pub struct QueueRow {
    /// Package atom.
    pub package: String,
    /// Lifecycle state.
    pub status: String,
    /// Assignee drone name.
    pub assigned_to: Option<String>,
    /// Failures accumulated.
    pub failures: i64,
    /// Last error detail.
    pub error_message: String,
    /// Assignment time.
    pub assigned_at: Option<f64>,
    /// Completion time.
    pub completed_at: Option<f64>,
}

/// `GET /api/v1/queue`
pub async fn queue_listing(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueRow>>> {
    let mut rows = Vec::new();
    for status in ["delegated", "needed", "blocked", "failed", "received"] {
        for item in state.store.queue_items(status, 1000).await? {
            let assigned_to = match item.assigned_to.as_deref() {
                Some(id) => Some(state.store.drone_name(id).await),
                None => None,
            };
            rows.push(QueueRow {
                package: item.package,
                status: item.status,
                assigned_to,
                failures: item.failure_count,
                error_message: item.error_message.unwrap_or_default(),
                assigned_at: item.assigned_at,
                completed_at: item.completed_at,
            });
        }
    }
    Ok(Json(rows))
}
