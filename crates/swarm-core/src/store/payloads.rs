// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload version registry, per-drone deployment state and deploy log.

use serde::Serialize;
use sqlx::FromRow;

use super::Store;
use crate::error::{CoreError, Result};
use crate::types::now_ts;

/// A registered payload version (content not included).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PayloadVersion {
    /// Row id.
    pub id: i64,
    /// Payload kind (drone_binary, init_script, config, portage_config).
    pub kind: String,
    /// Version label, unique per kind.
    pub version: String,
    /// SHA-256 of the content, hex.
    pub hash: String,
    /// Blob file path when too large to inline.
    pub content_path: Option<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// Operator notes.
    pub notes: Option<String>,
    /// Registration time.
    pub created_at: f64,
    /// Registrar.
    pub created_by: Option<String>,
}

/// Per-drone deployed payload state.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DronePayload {
    /// Drone id.
    pub drone_id: String,
    /// Payload kind.
    pub kind: String,
    /// Deployed version.
    pub version: String,
    /// Hash recorded at deploy time.
    pub hash: String,
    /// deploying / deployed / failed.
    pub status: String,
    /// When the state last changed.
    pub deployed_at: Option<f64>,
    /// Operator who deployed.
    pub deployed_by: Option<String>,
    /// Failure detail.
    pub error_message: Option<String>,
}

/// One deploy-log row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeployLogRow {
    /// Row id.
    pub id: i64,
    /// Drone id.
    pub drone_id: String,
    /// Payload kind.
    pub kind: String,
    /// Version attempted.
    pub version: String,
    /// deploy / revert / verify.
    pub action: String,
    /// success / failed.
    pub status: String,
    /// Attempt duration.
    pub duration_ms: Option<f64>,
    /// Failure detail.
    pub error_message: Option<String>,
    /// Operator.
    pub deployed_by: Option<String>,
    /// When the attempt happened.
    pub deployed_at: f64,
}

impl Store {
    /// Register a payload version. Duplicate `(kind, version)` with the
    /// same hash is idempotent; a different hash is a conflict.
    pub async fn create_payload_version(
        &self,
        kind: &str,
        version: &str,
        hash: &str,
        content_blob: Option<&[u8]>,
        content_path: Option<&str>,
        description: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<PayloadVersion> {
        if let Some(existing) = self.get_payload_version(kind, version).await? {
            if existing.hash == hash {
                return Ok(existing);
            }
            return Err(CoreError::Conflict(format!(
                "payload {kind} {version} already exists with different content"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO payload_versions
                (kind, version, hash, content_blob, content_path, description,
                 created_at, created_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(kind)
        .bind(version)
        .bind(hash)
        .bind(content_blob)
        .bind(content_path)
        .bind(description)
        .bind(now_ts())
        .bind(created_by)
        .execute(&self.pool)
        .await?;

        self.get_payload_version(kind, version)
            .await?
            .ok_or_else(|| CoreError::Other("payload vanished after insert".to_string()))
    }

    /// Fetch one payload version.
    pub async fn get_payload_version(
        &self,
        kind: &str,
        version: &str,
    ) -> Result<Option<PayloadVersion>> {
        let row = sqlx::query_as::<_, PayloadVersion>(
            r#"
            SELECT id, kind, version, hash, content_path, description, notes,
                   created_at, created_by
            FROM payload_versions WHERE kind = ? AND version = ?
            "#,
        )
        .bind(kind)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// List versions, optionally for one kind, newest first.
    pub async fn list_payload_versions(
        &self,
        kind: Option<&str>,
        limit: i64,
    ) -> Result<Vec<PayloadVersion>> {
        let rows = match kind {
            Some(k) => {
                sqlx::query_as::<_, PayloadVersion>(
                    r#"
                    SELECT id, kind, version, hash, content_path, description, notes,
                           created_at, created_by
                    FROM payload_versions WHERE kind = ?
                    ORDER BY created_at DESC, id DESC LIMIT ?
                    "#,
                )
                .bind(k)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PayloadVersion>(
                    r#"
                    SELECT id, kind, version, hash, content_path, description, notes,
                           created_at, created_by
                    FROM payload_versions
                    ORDER BY created_at DESC, id DESC LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Latest version of a kind.
    pub async fn latest_payload_version(&self, kind: &str) -> Result<Option<PayloadVersion>> {
        let row = sqlx::query_as::<_, PayloadVersion>(
            r#"
            SELECT id, kind, version, hash, content_path, description, notes,
                   created_at, created_by
            FROM payload_versions WHERE kind = ?
            ORDER BY created_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Inline content blob for a version, when stored inline.
    pub async fn payload_content_blob(&self, kind: &str, version: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Option<Vec<u8>>,)> = sqlx::query_as(
            "SELECT content_blob FROM payload_versions WHERE kind = ? AND version = ?",
        )
        .bind(kind)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(b,)| b))
    }

    /// Upsert the deployed payload state for a drone.
    pub async fn set_drone_payload(
        &self,
        drone_id: &str,
        kind: &str,
        version: &str,
        hash: &str,
        status: &str,
        deployed_by: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drone_payloads
                (drone_id, kind, version, hash, status, deployed_at, deployed_by)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(drone_id, kind) DO UPDATE SET
                version = excluded.version,
                hash = excluded.hash,
                status = excluded.status,
                deployed_at = excluded.deployed_at,
                deployed_by = excluded.deployed_by,
                error_message = NULL
            "#,
        )
        .bind(drone_id)
        .bind(kind)
        .bind(version)
        .bind(hash)
        .bind(status)
        .bind(now_ts())
        .bind(deployed_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a drone's payload deploy as failed.
    pub async fn mark_drone_payload_failed(
        &self,
        drone_id: &str,
        kind: &str,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE drone_payloads SET status = 'failed', error_message = ? WHERE drone_id = ? AND kind = ?",
        )
        .bind(error)
        .bind(drone_id)
        .bind(kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current payload state for one drone and kind.
    pub async fn get_drone_payload(
        &self,
        drone_id: &str,
        kind: &str,
    ) -> Result<Option<DronePayload>> {
        let row = sqlx::query_as::<_, DronePayload>(
            "SELECT * FROM drone_payloads WHERE drone_id = ? AND kind = ?",
        )
        .bind(drone_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All per-drone payload states, optionally for one kind.
    pub async fn list_drone_payloads(&self, kind: Option<&str>) -> Result<Vec<DronePayload>> {
        let rows = match kind {
            Some(k) => {
                sqlx::query_as::<_, DronePayload>("SELECT * FROM drone_payloads WHERE kind = ?")
                    .bind(k)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as::<_, DronePayload>("SELECT * FROM drone_payloads")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    /// The most recent successfully-deployed version for a drone before
    /// the current one (rollback target), from the deploy log.
    pub async fn previous_deployed_version(
        &self,
        drone_id: &str,
        kind: &str,
        current_version: &str,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT version FROM payload_deploy_log
            WHERE drone_id = ? AND kind = ? AND action = 'deploy' AND status = 'success'
              AND version != ?
            ORDER BY deployed_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(drone_id)
        .bind(kind)
        .bind(current_version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Append a deploy-log row.
    pub async fn log_payload_deploy(
        &self,
        drone_id: &str,
        kind: &str,
        version: &str,
        action: &str,
        status: &str,
        duration_ms: Option<f64>,
        error_message: Option<&str>,
        deployed_by: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payload_deploy_log
                (drone_id, kind, version, action, status, duration_ms,
                 error_message, deployed_by, deployed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(drone_id)
        .bind(kind)
        .bind(version)
        .bind(action)
        .bind(status)
        .bind(duration_ms)
        .bind(error_message)
        .bind(deployed_by)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deploy history, newest first, optionally for one drone.
    pub async fn payload_deploy_history(
        &self,
        drone_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DeployLogRow>> {
        let rows = match drone_id {
            Some(d) => {
                sqlx::query_as::<_, DeployLogRow>(
                    "SELECT * FROM payload_deploy_log WHERE drone_id = ? ORDER BY deployed_at DESC, id DESC LIMIT ?",
                )
                .bind(d)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DeployLogRow>(
                    "SELECT * FROM payload_deploy_log ORDER BY deployed_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Distinct payload kinds on record.
    pub async fn payload_kinds(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT kind FROM payload_versions ORDER BY kind")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent_on_same_hash_conflict_on_different() {
        let store = Store::open_in_memory().await.unwrap();

        let v = store
            .create_payload_version("drone_binary", "v0.4.0", "abc123", Some(b"bytes"), None, None, None)
            .await
            .unwrap();
        assert_eq!(v.version, "v0.4.0");

        // Same hash: idempotent.
        let again = store
            .create_payload_version("drone_binary", "v0.4.0", "abc123", Some(b"bytes"), None, None, None)
            .await
            .unwrap();
        assert_eq!(again.id, v.id);

        // Different hash: conflict.
        let err = store
            .create_payload_version("drone_binary", "v0.4.0", "def456", Some(b"other"), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn blob_round_trip_and_latest() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_payload_version("config", "v1", "h1", Some(b"one"), None, None, None)
            .await
            .unwrap();
        store
            .create_payload_version("config", "v2", "h2", Some(b"two"), None, None, None)
            .await
            .unwrap();

        let blob = store.payload_content_blob("config", "v1").await.unwrap();
        assert_eq!(blob.as_deref(), Some(&b"one"[..]));

        let latest = store.latest_payload_version("config").await.unwrap().unwrap();
        assert_eq!(latest.version, "v2");
    }

    #[tokio::test]
    async fn drone_payload_state_and_rollback_target() {
        let store = Store::open_in_memory().await.unwrap();

        store
            .log_payload_deploy("d1", "drone_binary", "v1", "deploy", "success", None, None, None)
            .await
            .unwrap();
        store
            .log_payload_deploy("d1", "drone_binary", "v2", "deploy", "failed", None, Some("hash mismatch"), None)
            .await
            .unwrap();

        let prev = store
            .previous_deployed_version("d1", "drone_binary", "v2")
            .await
            .unwrap();
        assert_eq!(prev.as_deref(), Some("v1"));

        store
            .set_drone_payload("d1", "drone_binary", "v2", "h2", "deploying", Some("admin"))
            .await
            .unwrap();
        store
            .mark_drone_payload_failed("d1", "drone_binary", "hash mismatch")
            .await
            .unwrap();

        let state = store.get_drone_payload("d1", "drone_binary").await.unwrap().unwrap();
        assert_eq!(state.status, "failed");
        assert_eq!(state.error_message.as_deref(), Some("hash mismatch"));
    }
}
