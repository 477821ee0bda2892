// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin handlers: queue control, node actions, self-healing views,
//! payloads, releases, drone config, logs and the SQL explorer.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use swarm_core::store::drone_config::DroneConfigPatch;
use swarm_core::store::nodes::Node;
use swarm_core::types::DroneKind;

use super::error::{ApiError, ApiResult};
use super::AppState;

async fn resolve_node(state: &AppState, name: &str) -> ApiResult<Node> {
    state
        .store
        .resolve_node(name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Node not found: {name}")))
}

// ── Queue & control ───────────────────────────────────────────────────

/// Queue submission body.
#[derive(Debug, Deserialize)]
pub struct QueueSubmit {
    /// Package atoms to queue.
    pub packages: Vec<String>,
    /// Name for a new session owning these items.
    #[serde(default)]
    pub session_name: Option<String>,
}

/// `POST /api/v1/queue`
pub async fn submit_queue(
    State(state): State<AppState>,
    Json(body): Json<QueueSubmit>,
) -> ApiResult<Json<Value>> {
    if body.packages.is_empty() {
        return Err(ApiError::validation("No packages"));
    }

    let session_id = match body.session_name.as_deref() {
        Some(name) => Some(state.store.create_session(Some(name), 0).await?),
        None => state.store.active_session().await?.map(|s| s.id),
    };

    let added = state
        .store
        .enqueue_packages(&body.packages, session_id.as_deref())
        .await?;
    if let Some(sid) = session_id.as_deref() {
        state.store.bump_session_total(sid, added.len() as i64).await?;
    }

    info!(queued = added.len(), submitted = body.packages.len(), "Packages queued");
    if !added.is_empty() {
        state.events.publish(
            "queue",
            format!("{} packages queued", added.len()),
            Some(json!({ "count": added.len(), "session_id": &session_id })),
            None,
            None,
        );
    }

    Ok(Json(json!({
        "status": "ok",
        "queued": added.len(),
        "session_id": session_id,
    })))
}

/// Control action body.
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    /// Action name.
    pub action: String,
    /// Package for package-scoped actions.
    #[serde(default)]
    pub package: Option<String>,
    /// Drone for drone-scoped actions.
    #[serde(default)]
    pub drone: Option<String>,
}

/// `POST /api/v1/control`
pub async fn control(
    State(state): State<AppState>,
    Json(body): Json<ControlRequest>,
) -> ApiResult<Json<Value>> {
    match body.action.as_str() {
        "pause" => {
            state.store.set_setting("paused", "true").await?;
            info!("Queue paused");
            state.events.publish("control", "Queue paused", None, None, None);
            Ok(Json(json!({ "status": "paused" })))
        }
        "resume" => {
            state.store.set_setting("paused", "false").await?;
            info!("Queue resumed");
            state.events.publish("control", "Queue resumed", None, None, None);
            Ok(Json(json!({ "status": "active" })))
        }
        "unblock" => match body.package.as_deref() {
            Some(package) => {
                let changed = state.store.unblock_package(package).await?;
                Ok(Json(json!({
                    "status": if changed { "ok" } else { "no_change" },
                    "package": package,
                })))
            }
            None => {
                let count = state.store.unblock_all().await?;
                state.events.publish(
                    "unblock",
                    format!("{count} packages unblocked"),
                    Some(json!({ "count": count })),
                    None,
                    None,
                );
                Ok(Json(json!({ "status": "ok", "unblocked": count })))
            }
        },
        "block" => {
            let package = body
                .package
                .as_deref()
                .ok_or_else(|| ApiError::validation_with_hint("block requires package", "pass {package}"))?;
            let changed = state.store.block_package(package).await?;
            Ok(Json(json!({
                "status": if changed { "ok" } else { "no_change" },
                "package": package,
            })))
        }
        "reclaim" => {
            let package = body
                .package
                .as_deref()
                .ok_or_else(|| ApiError::validation_with_hint("reclaim requires package", "pass {package}"))?;
            let changed = state.store.reclaim_package(package).await?;
            Ok(Json(json!({
                "status": if changed { "ok" } else { "no_change" },
                "package": package,
            })))
        }
        "unground" => {
            let node_id = match body.drone.as_deref() {
                Some(name) => Some(resolve_node(&state, name).await?.id),
                None => None,
            };
            state.health.unground(node_id.as_deref()).await?;
            Ok(Json(json!({ "status": "ok" })))
        }
        "reset" => {
            let session = state.store.active_session().await?;
            let count = state
                .store
                .reset_queue(session.as_ref().map(|s| s.id.as_str()))
                .await?;
            state.store.reset_drone_health(None).await?;
            info!(count, "Queue reset");
            Ok(Json(json!({ "status": "reset", "affected": count })))
        }
        "rebalance" => {
            let count = state.store.reclaim_all_delegated().await?;
            info!(count, "All delegated work reclaimed for rebalance");
            state.events.publish(
                "control",
                format!("Rebalance reclaimed {count} packages"),
                Some(json!({ "count": count })),
                None,
                None,
            );
            Ok(Json(json!({ "status": "ok", "reclaimed": count })))
        }
        "clear_failures" => {
            let count = state.store.clear_failures().await?;
            Ok(Json(json!({ "status": "ok", "cleared": count })))
        }
        "retry_failures" => {
            let count = state.store.unblock_all().await?;
            Ok(Json(json!({ "status": "ok", "requeued": count })))
        }
        other => Err(ApiError::validation_with_hint(
            format!("Unknown action: {other}"),
            "expected pause, resume, unblock, block, reclaim, unground, reset, \
             rebalance, clear_failures or retry_failures",
        )),
    }
}

// ── Node actions ──────────────────────────────────────────────────────

/// `POST /api/v1/nodes/{name}/pause`
pub async fn pause_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let node = resolve_node(&state, &name).await?;
    state.store.set_node_paused(&node.id, true).await?;
    Ok(Json(json!({ "status": "paused", "name": node.name })))
}

/// `POST /api/v1/nodes/{name}/resume`
pub async fn resume_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let node = resolve_node(&state, &name).await?;
    state.store.set_node_paused(&node.id, false).await?;
    Ok(Json(json!({ "status": "resumed", "name": node.name })))
}

/// `POST /api/v1/nodes/{name}/ping`
pub async fn ping_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let node = resolve_node(&state, &name).await?;
    let report = state.healer.ping(&node).await;
    Ok(Json(serde_json::to_value(report)?))
}

/// `POST /api/v1/nodes/{name}/reset-escalation`
pub async fn reset_escalation(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let node = resolve_node(&state, &name).await?;
    state.healer.reset_escalation(&node.id).await?;
    Ok(Json(json!({ "status": "ok", "name": node.name })))
}

/// Set-type body.
#[derive(Debug, Deserialize)]
pub struct SetTypeRequest {
    /// container / vm / bare-metal / unknown.
    pub drone_type: String,
}

/// `POST /api/v1/nodes/{name}/set-type`
///
/// The self-healer reads the kind fresh on each evaluation, so the
/// change applies from the next probe tick; an action already running
/// finishes.
pub async fn set_node_type(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SetTypeRequest>,
) -> ApiResult<Json<Value>> {
    if !matches!(
        body.drone_type.as_str(),
        "container" | "vm" | "bare-metal" | "unknown"
    ) {
        return Err(ApiError::validation_with_hint(
            format!("Unknown drone type: {}", body.drone_type),
            "expected container, vm, bare-metal or unknown",
        ));
    }
    let node = resolve_node(&state, &name).await?;
    state
        .store
        .set_node_kind(&node.id, DroneKind::parse(&body.drone_type))
        .await?;
    Ok(Json(json!({ "status": "ok", "name": node.name, "drone_type": body.drone_type })))
}

/// `DELETE /api/v1/nodes/{name}`
pub async fn delete_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let node = resolve_node(&state, &name).await?;
    state.store.remove_node(&node.id).await?;
    Ok(Json(json!({ "status": "deleted", "id": node.id })))
}

// ── Self-healing views ────────────────────────────────────────────────

/// Ping query.
#[derive(Debug, Deserialize)]
pub struct PingQuery {
    /// Drone name or id.
    #[serde(default)]
    pub drone: Option<String>,
}

/// `GET /api/v1/ping?drone=<name>`
pub async fn ping_one(
    State(state): State<AppState>,
    Query(query): Query<PingQuery>,
) -> ApiResult<Json<Value>> {
    let Some(drone) = query.drone else {
        return Err(ApiError::validation_with_hint(
            "Missing drone parameter",
            "use /api/v1/ping?drone=<name> or /api/v1/ping/all",
        ));
    };
    let node = resolve_node(&state, &drone).await?;
    let report = state.healer.ping(&node).await;
    Ok(Json(serde_json::to_value(report)?))
}

/// `GET /api/v1/ping/all`
pub async fn ping_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let reports = state.healer.ping_all().await?;
    Ok(Json(json!({ "count": reports.len(), "results": reports })))
}

/// `GET /api/v1/escalation`
pub async fn escalation(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let states = state.healer.escalation_states().await;
    let mut out = Vec::with_capacity(states.len());
    for (node_id, escalation) in states {
        let name = state.store.drone_name(&node_id).await;
        out.push(json!({
            "drone": name,
            "drone_id": node_id,
            "state": escalation,
        }));
    }
    Ok(Json(json!({ "escalations": out })))
}

// ── SQL explorer ──────────────────────────────────────────────────────

/// `GET /api/v1/sql/tables`
pub async fn sql_tables(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let tables = state.store.explorer_tables().await?;
    Ok(Json(json!({ "tables": tables })))
}

/// `GET /api/v1/sql/schema`
pub async fn sql_schema(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let schema = state.store.explorer_schema().await?;
    Ok(Json(json!({ "schema": schema })))
}

/// Explorer query string.
#[derive(Debug, Deserialize)]
pub struct SqlQuery {
    /// The SELECT statement.
    #[serde(default)]
    pub q: Option<String>,
}

/// `GET /api/v1/sql/query?q=SELECT...`
pub async fn sql_query(
    State(state): State<AppState>,
    Query(query): Query<SqlQuery>,
) -> ApiResult<Json<Value>> {
    let Some(q) = query.q else {
        return Err(ApiError::validation("Missing query parameter q"));
    };
    let result = state.store.explorer_query(&q).await?;
    Ok(Json(serde_json::to_value(result)?))
}

// ── Protocol log ──────────────────────────────────────────────────────

/// Protocol entries query.
#[derive(Debug, Deserialize)]
pub struct ProtocolQuery {
    /// Return entries with id greater than this.
    #[serde(default)]
    pub since: Option<i64>,
    /// Filter by classification tag.
    #[serde(default, rename = "type")]
    pub msg_type: Option<String>,
    /// Filter by drone id.
    #[serde(default)]
    pub drone: Option<String>,
    /// Maximum entries returned.
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /admin/api/protocol[?since&type&drone&limit]`
pub async fn protocol_entries(
    State(state): State<AppState>,
    Query(query): Query<ProtocolQuery>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .store
        .protocol_entries(
            query.since.unwrap_or(0),
            query.msg_type.as_deref(),
            query.drone.as_deref(),
            query.limit.unwrap_or(200).min(2000),
        )
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for mut row in rows {
        // Older rows captured before the drone registered carry only the
        // raw id; resolve the display name at read time.
        if row.source_node.is_none() {
            if let Some(id) = row.drone_id.as_deref() {
                row.source_node = Some(state.store.drone_name(id).await);
            }
        }
        entries.push(row);
    }
    Ok(Json(json!({ "entries": entries })))
}

/// `GET /admin/api/protocol/{id}`
pub async fn protocol_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let detail = state
        .store
        .protocol_detail(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Protocol entry not found: {id}")))?;
    Ok(Json(serde_json::to_value(detail)?))
}

/// Protocol stats query.
#[derive(Debug, Deserialize)]
pub struct ProtocolStatsQuery {
    /// Only count entries newer than this timestamp.
    #[serde(default)]
    pub since: Option<f64>,
}

/// `GET /admin/api/protocol/stats[?since]`
pub async fn protocol_stats(
    State(state): State<AppState>,
    Query(query): Query<ProtocolStatsQuery>,
) -> ApiResult<Json<Value>> {
    let stats = state.store.protocol_stats(query.since).await?;
    Ok(Json(serde_json::to_value(stats)?))
}

/// Density query. Defaults to the last hour in 100 buckets.
#[derive(Debug, Deserialize)]
pub struct DensityQuery {
    /// Window start timestamp.
    #[serde(default)]
    pub start: Option<f64>,
    /// Window end timestamp.
    #[serde(default)]
    pub end: Option<f64>,
    /// Histogram resolution.
    #[serde(default)]
    pub buckets: Option<usize>,
}

/// `GET /admin/api/protocol/density[?start&end&buckets]`
pub async fn protocol_density(
    State(state): State<AppState>,
    Query(query): Query<DensityQuery>,
) -> ApiResult<Json<Value>> {
    let end = query.end.unwrap_or_else(swarm_core::types::now_ts);
    let start = query.start.unwrap_or(end - 3600.0);
    let buckets = query.buckets.unwrap_or(100).min(500);
    let density = state.store.protocol_density(start, end, buckets).await?;
    Ok(Json(json!({ "density": density, "start": start, "end": end })))
}

/// Snapshot query.
#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    /// Point in time to reconstruct; now when omitted.
    #[serde(default)]
    pub at: Option<f64>,
}

/// `GET /admin/api/protocol/snapshot[?at]`
pub async fn protocol_snapshot(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<Json<Value>> {
    let at = query.at.unwrap_or_else(swarm_core::types::now_ts);
    let snapshot = state.store.protocol_state_at(at).await?;
    Ok(Json(serde_json::to_value(snapshot)?))
}

// ── Payloads ──────────────────────────────────────────────────────────

/// `GET /admin/api/payloads`
pub async fn list_payloads(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let versions = state.store.list_payload_versions(None, 200).await?;
    Ok(Json(json!({ "payloads": versions })))
}

/// Payload registration body.
#[derive(Debug, Deserialize)]
pub struct RegisterPayload {
    /// Payload kind.
    pub kind: String,
    /// Version label.
    pub version: String,
    /// Base64-encoded content.
    pub content_base64: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Registrar.
    #[serde(default)]
    pub created_by: Option<String>,
}

/// `POST /admin/api/payloads`
pub async fn register_payload(
    State(state): State<AppState>,
    Json(body): Json<RegisterPayload>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.kind.is_empty() || body.version.is_empty() {
        return Err(ApiError::validation("kind and version are required"));
    }
    let content = STANDARD
        .decode(&body.content_base64)
        .map_err(|_| ApiError::validation("content_base64 is not valid base64"))?;

    let record = state
        .payloads
        .register_version(
            &body.kind,
            &body.version,
            &content,
            body.description.as_deref(),
            body.created_by.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(record)?)))
}

/// `GET /admin/api/payloads/status`
pub async fn payload_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(state.payloads.deployment_status().await?))
}

/// `GET /admin/api/payloads/{kind}/versions`
pub async fn payload_versions(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Value>> {
    let versions = state.store.list_payload_versions(Some(&kind), 100).await?;
    Ok(Json(json!({ "kind": kind, "versions": versions })))
}

/// Single-drone deploy body.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    /// Target drone name.
    pub drone: String,
    /// Verify the remote hash after transfer.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Operator.
    #[serde(default)]
    pub deployed_by: Option<String>,
}

fn default_true() -> bool {
    true
}

/// `POST /admin/api/payloads/{kind}/{version}/deploy`
///
/// Deploy failures answer 200 with the error in the body; the attempt
/// itself is the resource being reported on.
pub async fn deploy_payload(
    State(state): State<AppState>,
    Path((kind, version)): Path<(String, String)>,
    Json(body): Json<DeployRequest>,
) -> ApiResult<Json<Value>> {
    let result = state
        .payloads
        .deploy_to_drone(
            &body.drone,
            &kind,
            &version,
            body.deployed_by.as_deref(),
            body.verify,
        )
        .await?;
    Ok(Json(serde_json::to_value(result)?))
}

/// Rolling deploy body.
#[derive(Debug, Deserialize)]
pub struct RollingDeployRequest {
    /// Target drones; all outdated drones when omitted.
    #[serde(default)]
    pub drones: Option<Vec<String>>,
    /// Probe each drone after deploying.
    #[serde(default = "default_true")]
    pub health_check: bool,
    /// Revert the failed drone and stop on first failure.
    #[serde(default = "default_true")]
    pub rollback_on_fail: bool,
    /// Operator.
    #[serde(default)]
    pub deployed_by: Option<String>,
}

/// `POST /admin/api/payloads/{kind}/{version}/rolling-deploy`
pub async fn rolling_deploy(
    State(state): State<AppState>,
    Path((kind, version)): Path<(String, String)>,
    Json(body): Json<RollingDeployRequest>,
) -> ApiResult<Json<Value>> {
    let report = state
        .payloads
        .rolling_deploy(
            &kind,
            &version,
            body.drones,
            body.deployed_by.as_deref(),
            body.health_check,
            body.rollback_on_fail,
        )
        .await?;
    Ok(Json(serde_json::to_value(report)?))
}

/// Verify body.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// Target drone name.
    pub drone: String,
}

/// `POST /admin/api/payloads/{kind}/verify`
pub async fn verify_payload(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<VerifyRequest>,
) -> ApiResult<Json<Value>> {
    let report = state.payloads.verify_drone(&body.drone, &kind).await?;
    Ok(Json(serde_json::to_value(report)?))
}

// ── Releases ──────────────────────────────────────────────────────────

/// `GET /admin/api/releases`
pub async fn list_releases(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let releases = state.releases.list().await?;
    Ok(Json(json!({ "releases": releases })))
}

/// Release creation body.
#[derive(Debug, Deserialize)]
pub struct CreateRelease {
    /// Version label; generated from the date when omitted.
    #[serde(default)]
    pub version: Option<String>,
    /// Human name.
    #[serde(default)]
    pub name: Option<String>,
    /// Notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Creator.
    #[serde(default)]
    pub created_by: Option<String>,
}

/// `POST /admin/api/releases`
pub async fn create_release(
    State(state): State<AppState>,
    Json(body): Json<CreateRelease>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let release = state
        .releases
        .create(
            body.version.as_deref(),
            body.name.as_deref(),
            body.notes.as_deref(),
            body.created_by.as_deref().unwrap_or("admin"),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(release)?)))
}

/// Diff query.
#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    /// Source version.
    #[serde(default)]
    pub from: Option<String>,
    /// Target version.
    #[serde(default)]
    pub to: Option<String>,
}

/// `GET /admin/api/releases/diff?from&to`
pub async fn diff_releases(
    State(state): State<AppState>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<Value>> {
    let (Some(from), Some(to)) = (query.from, query.to) else {
        return Err(ApiError::validation("Both \"from\" and \"to\" parameters are required"));
    };
    let diff = state.releases.diff(&from, &to).await?;
    Ok(Json(serde_json::to_value(diff)?))
}

/// `GET /admin/api/releases/{version}`
pub async fn get_release(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<Json<Value>> {
    let release = state
        .releases
        .get(&version)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Release not found: {version}")))?;
    Ok(Json(serde_json::to_value(release)?))
}

/// `GET /admin/api/releases/{version}/packages`
pub async fn release_packages(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<Json<Value>> {
    let packages = state.releases.packages(&version).await?;
    Ok(Json(json!({ "version": version, "packages": packages })))
}

/// `POST /admin/api/releases/{version}/promote`
pub async fn promote_release(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.releases.promote(&version).await?;
    Ok(Json(serde_json::to_value(outcome)?))
}

/// `POST /admin/api/releases/{version}/archive`
pub async fn archive_release(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<Json<Value>> {
    let release = state.releases.archive(&version).await?;
    Ok(Json(serde_json::to_value(release)?))
}

/// `POST /admin/api/releases/rollback`
pub async fn rollback_release(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let outcome = state.releases.rollback().await?;
    Ok(Json(serde_json::to_value(outcome)?))
}

/// `DELETE /admin/api/releases/{version}`
pub async fn delete_release(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.releases.delete(&version).await?;
    Ok(Json(serde_json::to_value(outcome)?))
}

/// `GET /admin/api/releases/binhost`
pub async fn binhost_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(state.releases.binhost_status().await?))
}

// ── Drone config ──────────────────────────────────────────────────────

/// `GET /admin/api/drone-configs`
pub async fn list_drone_configs(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let configs = state.store.list_drone_configs().await?;
    Ok(Json(json!({ "configs": configs })))
}

/// `GET /admin/api/drone-config/{name}`
pub async fn get_drone_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.store.get_drone_config(&name).await? {
        Some(config) => Ok(Json(serde_json::to_value(config)?)),
        None => Ok(Json(json!({
            "node_name": name,
            "ssh_user": "root",
            "ssh_port": 22,
            "auto_reboot": 1,
            "protected": 0,
            "locked": 0,
            "_unconfigured": true,
        }))),
    }
}

/// `POST /admin/api/drone-config/{name}`
pub async fn upsert_drone_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<DroneConfigPatch>,
) -> ApiResult<Json<Value>> {
    let config = state.store.upsert_drone_config(&name, &patch).await?;
    Ok(Json(serde_json::to_value(config)?))
}

/// `DELETE /admin/api/drone-config/{name}`
pub async fn delete_drone_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state.store.delete_drone_config(&name).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("No config for {name}")));
    }
    Ok(Json(json!({ "status": "ok", "deleted": name })))
}

// ── Logs & system ─────────────────────────────────────────────────────

/// Log tail query.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Number of trailing lines.
    #[serde(default)]
    pub lines: Option<usize>,
}

/// `GET /admin/api/logs/control-plane[?lines]`
pub async fn control_plane_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Value>> {
    let path = state.config.log_file();
    let lines = query.lines.unwrap_or(200).min(5000);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError::NotFound(format!("cannot read {}: {e}", path.display())))?;
    let tail: Vec<&str> = content.lines().rev().take(lines).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    Ok(Json(json!({ "path": path, "lines": tail })))
}

/// `GET /admin/api/drones/{name}/syslog[?lines]`
pub async fn drone_syslog(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Value>> {
    let node = resolve_node(&state, &name).await?;
    let host = node
        .ip
        .clone()
        .ok_or_else(|| ApiError::validation(format!("No IP for drone {name}")))?;
    let ssh = state.store.ssh_settings(&node.name).await?;
    let target = crate::link::LinkTarget {
        name: node.name.clone(),
        host,
        user: ssh.user,
        port: ssh.port,
        key_path: ssh.key_path,
        connect_timeout: state.config.ssh_connect_timeout,
    };

    let lines = query.lines.unwrap_or(200).min(5000);
    let command = format!(
        "tail -n {lines} /var/log/messages 2>/dev/null || journalctl -n {lines} --no-pager 2>/dev/null"
    );
    let output = state
        .link
        .run(&target, &command, state.config.ssh_op_timeout)
        .await
        .map_err(|e| ApiError::Internal(format!("syslog tail failed: {e}")))?;

    Ok(Json(json!({
        "drone": node.name,
        "lines": output.stdout.lines().collect::<Vec<_>>(),
        "truncated": false,
    })))
}

/// `GET /admin/api/system/info`
pub async fn system_info(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let db_size = state.store.db_size_bytes().await.unwrap_or(0);
    let uptime = state.uptime_s();
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": uptime.round(),
        "uptime_human": format!("{}h {}m", (uptime as i64) / 3600, ((uptime as i64) % 3600) / 60),
        "db_path": state.config.db_path(),
        "db_size_mb": (db_size as f64 / 1048576.0 * 100.0).round() / 100.0,
        "public_port": state.config.public_port,
        "admin_port": state.config.admin_port,
        "probe_interval_s": state.config.probe_interval.as_secs(),
        "event_drop_count": state.events.dropped_count(),
    })))
}
