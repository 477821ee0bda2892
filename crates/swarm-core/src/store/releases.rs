// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release rows and their state machine transitions.
//!
//! `staging → active → archived → deleted`, at most one `active` at a
//! time. Filesystem mutations belong to the control plane's release
//! manager; every transition here is atomic in the database and the
//! database stays authoritative when the filesystem diverges.

use serde::Serialize;
use sqlx::FromRow;

use super::Store;
use crate::error::{CoreError, Result};
use crate::types::now_ts;

/// A release row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Release {
    /// Row id.
    pub id: i64,
    /// Unique version label.
    pub version: String,
    /// Optional human name.
    pub name: Option<String>,
    /// staging / active / archived / deleted.
    pub status: String,
    /// Artifact count at snapshot time.
    pub package_count: i64,
    /// Snapshot size in MiB.
    pub size_mb: f64,
    /// Snapshot directory.
    pub path: String,
    /// Creation time.
    pub created_at: f64,
    /// Last promotion time.
    pub promoted_at: Option<f64>,
    /// Archival time.
    pub archived_at: Option<f64>,
    /// Creator.
    pub created_by: Option<String>,
    /// Notes.
    pub notes: Option<String>,
}

/// Result of a promote transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The release became active; holds the previously active version.
    Promoted(Option<String>),
    /// The release was already active; nothing changed.
    AlreadyActive,
}

impl Store {
    /// Insert a new `staging` release row.
    pub async fn create_release(
        &self,
        version: &str,
        name: Option<&str>,
        package_count: i64,
        size_mb: f64,
        path: &str,
        created_by: Option<&str>,
        notes: Option<&str>,
    ) -> Result<Release> {
        if self.get_release(version).await?.is_some() {
            return Err(CoreError::Conflict(format!(
                "release {version} already exists"
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO releases (version, name, status, package_count, size_mb,
                                  path, created_at, created_by, notes)
            VALUES (?, ?, 'staging', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version)
        .bind(name)
        .bind(package_count)
        .bind(size_mb)
        .bind(path)
        .bind(now_ts())
        .bind(created_by)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        self.get_release(version)
            .await?
            .ok_or_else(|| CoreError::Other("release vanished after insert".to_string()))
    }

    /// Fetch a non-deleted release by version.
    pub async fn get_release(&self, version: &str) -> Result<Option<Release>> {
        let row = sqlx::query_as::<_, Release>(
            "SELECT * FROM releases WHERE version = ? AND status != 'deleted'",
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// List non-deleted releases, newest first.
    pub async fn list_releases(&self) -> Result<Vec<Release>> {
        let rows = sqlx::query_as::<_, Release>(
            "SELECT * FROM releases WHERE status != 'deleted' ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// The active release, if any.
    pub async fn active_release(&self) -> Result<Option<Release>> {
        let row = sqlx::query_as::<_, Release>("SELECT * FROM releases WHERE status = 'active'")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Promote a release: archive the current active (if different) and
    /// mark this one active, in one transaction. Promoting the active
    /// release is a no-op.
    pub async fn promote_release(&self, version: &str) -> Result<PromoteOutcome> {
        let mut tx = self.pool.begin().await?;

        let target: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, status FROM releases WHERE version = ? AND status != 'deleted'",
        )
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((target_id, target_status)) = target else {
            return Err(CoreError::NotFound(format!("release {version}")));
        };
        if target_status == "active" {
            tx.commit().await?;
            return Ok(PromoteOutcome::AlreadyActive);
        }

        let now = now_ts();
        let previous: Option<(i64, String)> =
            sqlx::query_as("SELECT id, version FROM releases WHERE status = 'active'")
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((prev_id, _)) = &previous {
            sqlx::query("UPDATE releases SET status = 'archived', archived_at = ? WHERE id = ?")
                .bind(now)
                .bind(prev_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE releases SET status = 'active', promoted_at = ? WHERE id = ?")
            .bind(now)
            .bind(target_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PromoteOutcome::Promoted(previous.map(|(_, v)| v)))
    }

    /// Archive a release. Archiving the active release is allowed and
    /// leaves zero active.
    pub async fn archive_release(&self, version: &str) -> Result<Release> {
        let release = self
            .get_release(version)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("release {version}")))?;
        if release.status != "archived" {
            sqlx::query("UPDATE releases SET status = 'archived', archived_at = ? WHERE id = ?")
                .bind(now_ts())
                .bind(release.id)
                .execute(&self.pool)
                .await?;
        }
        self.get_release(version)
            .await?
            .ok_or_else(|| CoreError::Other("release vanished".to_string()))
    }

    /// Mark a release deleted. The active release cannot be deleted. The
    /// row is retained.
    pub async fn mark_release_deleted(&self, version: &str) -> Result<Release> {
        let release = self
            .get_release(version)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("release {version}")))?;
        if release.status == "active" {
            return Err(CoreError::Conflict(
                "cannot delete the active release".to_string(),
            ));
        }
        sqlx::query("UPDATE releases SET status = 'deleted' WHERE id = ?")
            .bind(release.id)
            .execute(&self.pool)
            .await?;
        Ok(release)
    }

    /// Most recently promoted archived release (rollback target).
    pub async fn last_promoted_archived(&self) -> Result<Option<Release>> {
        let row = sqlx::query_as::<_, Release>(
            r#"
            SELECT * FROM releases
            WHERE status = 'archived' AND promoted_at IS NOT NULL
            ORDER BY promoted_at DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
