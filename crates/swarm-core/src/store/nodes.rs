// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node (drone) registry operations.

use serde::Serialize;
use sqlx::FromRow;

use super::Store;
use crate::error::Result;
use crate::types::{now_ts, Capabilities, DroneKind, Metrics};

/// Node record as stored.
#[derive(Debug, Clone, FromRow)]
pub struct Node {
    /// Stable machine-derived identifier.
    pub id: String,
    /// Unique human name.
    pub name: String,
    /// Primary address.
    pub ip: Option<String>,
    /// Machine kind; gates reboot actions.
    pub kind: String,
    /// Worker role (drone or sweeper).
    pub node_type: String,
    /// CPU core count from the last heartbeat.
    pub cores: Option<i64>,
    /// RAM in gigabytes from the last heartbeat.
    pub ram_gb: Option<f64>,
    /// online / offline.
    pub status: String,
    /// Administratively paused.
    pub paused: i64,
    /// Last heartbeat timestamp.
    pub last_seen: Option<f64>,
    /// Raw capabilities JSON.
    pub capabilities_json: Option<String>,
    /// Raw metrics JSON.
    pub metrics_json: Option<String>,
    /// Package the drone reports building.
    pub current_task: Option<String>,
    /// Agent version string.
    pub version: Option<String>,
    /// Last proof-of-life ping send time.
    pub last_ping_at: Option<f64>,
    /// Last proof-of-life response time.
    pub last_pong_at: Option<f64>,
    /// Last proof-of-life round trip in milliseconds.
    pub ping_latency_ms: Option<f64>,
}

impl Node {
    /// Typed view of the capabilities JSON.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities_json
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }

    /// Typed view of the metrics JSON.
    pub fn metrics(&self) -> Metrics {
        self.metrics_json
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default()
    }

    /// Parsed machine kind.
    pub fn drone_kind(&self) -> DroneKind {
        DroneKind::parse(&self.kind)
    }

    /// Whether the node is currently marked online.
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    /// Whether the node is administratively paused.
    pub fn is_paused(&self) -> bool {
        self.paused != 0
    }
}

/// Heartbeat payload applied by [`Store::upsert_node`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeRegistration {
    /// Stable node id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Address the drone reports (or the peer address).
    pub ip: Option<String>,
    /// drone or sweeper.
    pub node_type: String,
    /// Capabilities from the heartbeat.
    pub capabilities: Capabilities,
    /// Metrics from the heartbeat.
    pub metrics: Metrics,
    /// Currently-building package label.
    pub current_task: Option<String>,
    /// Agent version.
    pub version: Option<String>,
}

impl Store {
    /// Register or refresh a node from a heartbeat. Returns the previous
    /// status (`None` when the node is new) so callers can emit a
    /// came-online event exactly once.
    pub async fn upsert_node(&self, reg: &NodeRegistration) -> Result<Option<String>> {
        let previous: Option<(String,)> =
            sqlx::query_as("SELECT status FROM nodes WHERE id = ?")
                .bind(&reg.id)
                .fetch_optional(&self.pool)
                .await?;

        // A different node that previously claimed this name is stale:
        // names are unique, ids are authoritative.
        sqlx::query("DELETE FROM nodes WHERE name = ? AND id != ?")
            .bind(&reg.name)
            .bind(&reg.id)
            .execute(&self.pool)
            .await?;

        let caps_json = serde_json::to_string(&reg.capabilities)?;
        let metrics_json = serde_json::to_string(&reg.metrics)?;

        sqlx::query(
            r#"
            INSERT INTO nodes (id, name, ip, node_type, cores, ram_gb, status,
                               last_seen, capabilities_json, metrics_json,
                               current_task, version)
            VALUES (?, ?, ?, ?, ?, ?, 'online', ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                ip = COALESCE(excluded.ip, ip),
                node_type = excluded.node_type,
                cores = COALESCE(excluded.cores, cores),
                ram_gb = COALESCE(excluded.ram_gb, ram_gb),
                status = 'online',
                last_seen = excluded.last_seen,
                capabilities_json = COALESCE(excluded.capabilities_json, capabilities_json),
                metrics_json = COALESCE(excluded.metrics_json, metrics_json),
                current_task = excluded.current_task,
                version = COALESCE(excluded.version, version)
            "#,
        )
        .bind(&reg.id)
        .bind(&reg.name)
        .bind(&reg.ip)
        .bind(&reg.node_type)
        .bind(reg.capabilities.cores)
        .bind(reg.capabilities.ram_gb)
        .bind(now_ts())
        .bind(&caps_json)
        .bind(&metrics_json)
        .bind(&reg.current_task)
        .bind(&reg.version)
        .execute(&self.pool)
        .await?;

        Ok(previous.map(|(s,)| s))
    }

    /// Fetch a node by id.
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(node)
    }

    /// Fetch a node by name.
    pub async fn get_node_by_name(&self, name: &str) -> Result<Option<Node>> {
        let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(node)
    }

    /// Fetch a node by name, falling back to id.
    pub async fn resolve_node(&self, name_or_id: &str) -> Result<Option<Node>> {
        if let Some(node) = self.get_node_by_name(name_or_id).await? {
            return Ok(Some(node));
        }
        self.get_node(name_or_id).await
    }

    /// List nodes, optionally including offline ones.
    pub async fn list_nodes(&self, include_offline: bool) -> Result<Vec<Node>> {
        let sql = if include_offline {
            "SELECT * FROM nodes ORDER BY name"
        } else {
            "SELECT * FROM nodes WHERE status = 'online' ORDER BY name"
        };
        let nodes = sqlx::query_as::<_, Node>(sql).fetch_all(&self.pool).await?;
        Ok(nodes)
    }

    /// Human name for a drone id; falls back to a truncated id.
    pub async fn drone_name(&self, id: &str) -> String {
        let name: Option<(String,)> = sqlx::query_as("SELECT name FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();
        match name {
            Some((n,)) => n,
            None => id.chars().take(12).collect(),
        }
    }

    /// Mark nodes offline whose heartbeat is older than `timeout_secs`.
    /// Nodes are never auto-deleted; dashboards keep fleet visibility.
    pub async fn mark_stale_nodes_offline(&self, timeout_secs: f64) -> Result<u64> {
        let cutoff = now_ts() - timeout_secs;
        let result = sqlx::query(
            "UPDATE nodes SET status = 'offline' WHERE last_seen < ? AND status = 'online'",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Pause or resume a node.
    pub async fn set_node_paused(&self, id: &str, paused: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET paused = ? WHERE id = ?")
            .bind(paused as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the machine kind for a node.
    pub async fn set_node_kind(&self, id: &str, kind: DroneKind) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET kind = ? WHERE id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a proof-of-life round trip on the node row.
    pub async fn record_ping(&self, id: &str, latency_ms: f64) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE nodes SET last_ping_at = ?, last_pong_at = ?, ping_latency_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(latency_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear a node's current-task label when it matches `package`
    /// (completion bookkeeping; the next heartbeat is authoritative).
    pub async fn clear_current_task(&self, id: &str, package: &str) -> Result<()> {
        sqlx::query("UPDATE nodes SET current_task = NULL WHERE id = ? AND current_task = ?")
            .bind(id)
            .bind(package)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a node (admin operation).
    pub async fn remove_node(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
