// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin-owned per-drone configuration, distinct from the drone's own
//! self-reported registration data.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Store;
use crate::error::Result;
use crate::types::now_ts;

/// Admin configuration for one drone, keyed by node name.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DroneConfig {
    /// Node name this config applies to.
    pub node_name: String,
    /// SSH user (default root).
    pub ssh_user: Option<String>,
    /// SSH port (default 22).
    pub ssh_port: Option<i64>,
    /// SSH identity file.
    pub ssh_key_path: Option<String>,
    /// SSH password, when key auth is unavailable.
    pub ssh_password: Option<String>,
    /// Cap on build cores.
    pub cores_limit: Option<i64>,
    /// Parallel build jobs.
    pub build_jobs: Option<i64>,
    /// Soft memory cap in gigabytes.
    pub ram_limit_gb: Option<f64>,
    /// Whether automated reboots are allowed.
    pub auto_reboot: i64,
    /// Protected drones never receive destructive actions.
    pub protected: i64,
    /// Per-drone circuit-breaker ceiling override.
    pub max_failures: Option<i64>,
    /// Artifact upload target override.
    pub binhost_url: Option<String>,
    /// Dashboard display name.
    pub display_name: Option<String>,
    /// Which control plane owns this drone.
    pub control_plane: Option<String>,
    /// Configuration lock flag.
    pub locked: i64,
    /// Free-text notes.
    pub notes: Option<String>,
    /// Creation time.
    pub created_at: f64,
    /// Last update time.
    pub updated_at: Option<f64>,
}

/// Patchable fields for [`Store::upsert_drone_config`]. Only present
/// fields are written.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DroneConfigPatch {
    /// SSH user.
    pub ssh_user: Option<String>,
    /// SSH port.
    pub ssh_port: Option<i64>,
    /// SSH identity file.
    pub ssh_key_path: Option<String>,
    /// SSH password.
    pub ssh_password: Option<String>,
    /// Core cap.
    pub cores_limit: Option<i64>,
    /// Parallel build jobs.
    pub build_jobs: Option<i64>,
    /// Soft memory cap.
    pub ram_limit_gb: Option<f64>,
    /// Reboot consent.
    pub auto_reboot: Option<bool>,
    /// Protection flag.
    pub protected: Option<bool>,
    /// Circuit-breaker ceiling override.
    pub max_failures: Option<i64>,
    /// Upload target override.
    pub binhost_url: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Owning control plane.
    pub control_plane: Option<String>,
    /// Lock flag.
    pub locked: Option<bool>,
    /// Notes.
    pub notes: Option<String>,
}

impl DroneConfigPatch {
    fn is_empty(&self) -> bool {
        self.ssh_user.is_none()
            && self.ssh_port.is_none()
            && self.ssh_key_path.is_none()
            && self.ssh_password.is_none()
            && self.cores_limit.is_none()
            && self.build_jobs.is_none()
            && self.ram_limit_gb.is_none()
            && self.auto_reboot.is_none()
            && self.protected.is_none()
            && self.max_failures.is_none()
            && self.binhost_url.is_none()
            && self.display_name.is_none()
            && self.control_plane.is_none()
            && self.locked.is_none()
            && self.notes.is_none()
    }
}

/// Resolved SSH connection settings with defaults applied.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Login user.
    pub user: String,
    /// Port.
    pub port: u16,
    /// Identity file, if configured.
    pub key_path: Option<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            key_path: None,
        }
    }
}

impl Store {
    /// Fetch the config for a drone, if one exists.
    pub async fn get_drone_config(&self, node_name: &str) -> Result<Option<DroneConfig>> {
        let row = sqlx::query_as::<_, DroneConfig>(
            "SELECT * FROM drone_config WHERE node_name = ?",
        )
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All drone configs.
    pub async fn list_drone_configs(&self) -> Result<Vec<DroneConfig>> {
        let rows = sqlx::query_as::<_, DroneConfig>(
            "SELECT * FROM drone_config ORDER BY node_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Create or patch a drone config. Absent patch fields keep their
    /// current values.
    pub async fn upsert_drone_config(
        &self,
        node_name: &str,
        patch: &DroneConfigPatch,
    ) -> Result<DroneConfig> {
        if self.get_drone_config(node_name).await?.is_none() {
            sqlx::query("INSERT INTO drone_config (node_name, created_at) VALUES (?, ?)")
                .bind(node_name)
                .bind(now_ts())
                .execute(&self.pool)
                .await?;
        }

        if !patch.is_empty() {
            sqlx::query(
                r#"
                UPDATE drone_config SET
                    ssh_user = COALESCE(?, ssh_user),
                    ssh_port = COALESCE(?, ssh_port),
                    ssh_key_path = COALESCE(?, ssh_key_path),
                    ssh_password = COALESCE(?, ssh_password),
                    cores_limit = COALESCE(?, cores_limit),
                    build_jobs = COALESCE(?, build_jobs),
                    ram_limit_gb = COALESCE(?, ram_limit_gb),
                    auto_reboot = COALESCE(?, auto_reboot),
                    protected = COALESCE(?, protected),
                    max_failures = COALESCE(?, max_failures),
                    binhost_url = COALESCE(?, binhost_url),
                    display_name = COALESCE(?, display_name),
                    control_plane = COALESCE(?, control_plane),
                    locked = COALESCE(?, locked),
                    notes = COALESCE(?, notes),
                    updated_at = ?
                WHERE node_name = ?
                "#,
            )
            .bind(&patch.ssh_user)
            .bind(patch.ssh_port)
            .bind(&patch.ssh_key_path)
            .bind(&patch.ssh_password)
            .bind(patch.cores_limit)
            .bind(patch.build_jobs)
            .bind(patch.ram_limit_gb)
            .bind(patch.auto_reboot.map(|b| b as i64))
            .bind(patch.protected.map(|b| b as i64))
            .bind(patch.max_failures)
            .bind(&patch.binhost_url)
            .bind(&patch.display_name)
            .bind(&patch.control_plane)
            .bind(patch.locked.map(|b| b as i64))
            .bind(&patch.notes)
            .bind(now_ts())
            .bind(node_name)
            .execute(&self.pool)
            .await?;
        }

        self.get_drone_config(node_name)
            .await?
            .ok_or_else(|| super::not_found(format!("drone config for {node_name}")))
    }

    /// Delete a drone config.
    pub async fn delete_drone_config(&self, node_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drone_config WHERE node_name = ?")
            .bind(node_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// SSH settings for a drone with defaults applied.
    pub async fn ssh_settings(&self, node_name: &str) -> Result<SshSettings> {
        let config = self.get_drone_config(node_name).await?;
        let mut settings = SshSettings::default();
        if let Some(config) = config {
            if let Some(user) = config.ssh_user {
                if !user.is_empty() {
                    settings.user = user;
                }
            }
            if let Some(port) = config.ssh_port {
                if (1..=65535).contains(&port) {
                    settings.port = port as u16;
                }
            }
            settings.key_path = config.ssh_key_path;
        }
        Ok(settings)
    }

    /// Whether this drone consents to automated reboots: the admin config
    /// wins, falling back to the drone's self-reported capability, then
    /// to true.
    pub async fn auto_reboot_allowed(&self, node_name: &str) -> Result<bool> {
        if let Some(config) = self.get_drone_config(node_name).await? {
            return Ok(config.auto_reboot != 0);
        }
        if let Some(node) = self.get_node_by_name(node_name).await? {
            if let Some(allowed) = node.capabilities().auto_reboot {
                return Ok(allowed);
            }
        }
        Ok(true)
    }

    /// Per-drone circuit-breaker ceiling, when overridden.
    pub async fn max_failures_override(&self, node_name: &str) -> Result<Option<i64>> {
        Ok(self
            .get_drone_config(node_name)
            .await?
            .and_then(|c| c.max_failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_patches_only_present_fields() {
        let store = Store::open_in_memory().await.unwrap();

        let config = store
            .upsert_drone_config(
                "drone-one",
                &DroneConfigPatch {
                    ssh_user: Some("builder".to_string()),
                    ssh_port: Some(2222),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(config.ssh_user.as_deref(), Some("builder"));
        assert_eq!(config.auto_reboot, 1);

        let config = store
            .upsert_drone_config(
                "drone-one",
                &DroneConfigPatch {
                    auto_reboot: Some(false),
                    max_failures: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Earlier fields survive the second patch.
        assert_eq!(config.ssh_user.as_deref(), Some("builder"));
        assert_eq!(config.ssh_port, Some(2222));
        assert_eq!(config.auto_reboot, 0);
        assert_eq!(config.max_failures, Some(4));
    }

    #[tokio::test]
    async fn ssh_settings_fall_back_to_defaults() {
        let store = Store::open_in_memory().await.unwrap();

        let settings = store.ssh_settings("unconfigured").await.unwrap();
        assert_eq!(settings.user, "root");
        assert_eq!(settings.port, 22);
        assert!(settings.key_path.is_none());

        store
            .upsert_drone_config(
                "drone-one",
                &DroneConfigPatch {
                    ssh_user: Some("builder".to_string()),
                    ssh_key_path: Some("/etc/swarm/id_ed25519".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let settings = store.ssh_settings("drone-one").await.unwrap();
        assert_eq!(settings.user, "builder");
        assert_eq!(settings.key_path.as_deref(), Some("/etc/swarm/id_ed25519"));
    }

    #[tokio::test]
    async fn auto_reboot_resolution_order() {
        let store = Store::open_in_memory().await.unwrap();

        // Nothing known: default allow.
        assert!(store.auto_reboot_allowed("drone-one").await.unwrap());

        // Self-reported capability denies.
        let mut reg = crate::store::nodes::NodeRegistration {
            id: "d1".to_string(),
            name: "drone-one".to_string(),
            node_type: "drone".to_string(),
            ..Default::default()
        };
        reg.capabilities.auto_reboot = Some(false);
        store.upsert_node(&reg).await.unwrap();
        assert!(!store.auto_reboot_allowed("drone-one").await.unwrap());

        // Admin config overrides the capability.
        store
            .upsert_drone_config(
                "drone-one",
                &DroneConfigPatch {
                    auto_reboot: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.auto_reboot_allowed("drone-one").await.unwrap());
    }

    #[tokio::test]
    async fn delete_config() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_drone_config("drone-one", &DroneConfigPatch::default())
            .await
            .unwrap();
        assert!(store.delete_drone_config("drone-one").await.unwrap());
        assert!(!store.delete_drone_config("drone-one").await.unwrap());
    }
}
