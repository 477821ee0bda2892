// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-drone health records: circuit breaker counters, upload failures,
//! escalation state and probe results.
//!
//! Grounding (build-failure circuit breaker) and escalation (probe-driven
//! recovery ladder) are independent dimensions stored side by side; the
//! monitors that own them never read each other's counters.

use serde::Serialize;
use sqlx::FromRow;

use super::Store;
use crate::error::Result;
use crate::types::now_ts;

/// Health record for one drone. Missing rows read as all-zero.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HealthRecord {
    /// Drone id.
    pub node_id: String,
    /// Consecutive-ish build failures (decayed by successes).
    pub failures: i64,
    /// Last build failure time.
    pub last_failure: Option<f64>,
    /// Whether the circuit breaker already rebooted this drone once.
    pub rebooted: i64,
    /// Grounded until this time; no assignments while in the future.
    pub grounded_until: Option<f64>,
    /// Consecutive artifact upload failures.
    pub upload_failures: i64,
    /// Last upload failure time.
    pub last_upload_failure: Option<f64>,
    /// Recovery ladder position (0–4).
    pub escalation_level: i64,
    /// When the last escalation action fired.
    pub last_escalation_at: Option<f64>,
    /// Total escalation actions taken since the last reset.
    pub escalation_attempts: i64,
    /// JSON of the last SSH probe result.
    pub last_probe_result: Option<String>,
    /// When the last probe ran.
    pub last_probe_at: Option<f64>,
}

impl HealthRecord {
    fn empty(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            failures: 0,
            last_failure: None,
            rebooted: 0,
            grounded_until: None,
            upload_failures: 0,
            last_upload_failure: None,
            escalation_level: 0,
            last_escalation_at: None,
            escalation_attempts: 0,
            last_probe_result: None,
            last_probe_at: None,
        }
    }

    /// Whether the drone is grounded at `now`.
    pub fn is_grounded(&self, now: f64) -> bool {
        self.grounded_until.is_some_and(|until| until > now)
    }
}

impl Store {
    /// Fetch the health record for a drone (all-zero default when absent).
    pub async fn drone_health(&self, node_id: &str) -> Result<HealthRecord> {
        let record =
            sqlx::query_as::<_, HealthRecord>("SELECT * FROM drone_health WHERE node_id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record.unwrap_or_else(|| HealthRecord::empty(node_id)))
    }

    /// Record a build failure; returns the updated record.
    pub async fn record_drone_failure(&self, node_id: &str) -> Result<HealthRecord> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO drone_health (node_id, failures, last_failure)
            VALUES (?, 1, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                failures = failures + 1,
                last_failure = excluded.last_failure
            "#,
        )
        .bind(node_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.drone_health(node_id).await
    }

    /// Successful build: decay the failure counter by one.
    pub async fn decay_drone_failures(&self, node_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE drone_health SET failures = MAX(failures - 1, 0) WHERE node_id = ?",
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ground a drone until the given time.
    pub async fn ground_drone(&self, node_id: &str, until: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drone_health (node_id, failures, grounded_until)
            VALUES (?, 0, ?)
            ON CONFLICT(node_id) DO UPDATE SET grounded_until = excluded.grounded_until
            "#,
        )
        .bind(node_id)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset the circuit breaker for one drone, or all drones.
    pub async fn reset_drone_health(&self, node_id: Option<&str>) -> Result<()> {
        match node_id {
            Some(id) => {
                sqlx::query(
                    "UPDATE drone_health SET failures = 0, rebooted = 0, grounded_until = NULL WHERE node_id = ?",
                )
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE drone_health SET failures = 0, rebooted = 0, grounded_until = NULL",
                )
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Mark that the circuit breaker rebooted this drone.
    pub async fn mark_drone_rebooted(&self, node_id: &str) -> Result<()> {
        sqlx::query("UPDATE drone_health SET rebooted = 1 WHERE node_id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record an upload failure.
    pub async fn record_upload_failure(&self, node_id: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO drone_health (node_id, failures, upload_failures, last_upload_failure)
            VALUES (?, 0, 1, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                upload_failures = upload_failures + 1,
                last_upload_failure = excluded.last_upload_failure
            "#,
        )
        .bind(node_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear the upload-failure streak.
    pub async fn reset_upload_failures(&self, node_id: &str) -> Result<()> {
        sqlx::query("UPDATE drone_health SET upload_failures = 0 WHERE node_id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether the drone's upload path is considered broken: the streak
    /// reached `threshold` and the last failure is newer than
    /// `retry_secs` (older streaks get another chance).
    pub async fn is_upload_impaired(
        &self,
        node_id: &str,
        threshold: i64,
        retry_secs: f64,
    ) -> Result<bool> {
        let record = self.drone_health(node_id).await?;
        if record.upload_failures < threshold {
            return Ok(false);
        }
        let last = record.last_upload_failure.unwrap_or(0.0);
        Ok(now_ts() - last <= retry_secs)
    }

    /// Persist escalation state (mirrors the monitor's in-memory map).
    pub async fn update_escalation_state(
        &self,
        node_id: &str,
        level: i64,
        attempts: i64,
    ) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO drone_health (node_id, failures, escalation_level,
                                      last_escalation_at, escalation_attempts)
            VALUES (?, 0, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                escalation_level = excluded.escalation_level,
                last_escalation_at = excluded.last_escalation_at,
                escalation_attempts = excluded.escalation_attempts
            "#,
        )
        .bind(node_id)
        .bind(level)
        .bind(now)
        .bind(attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset escalation bookkeeping for a drone.
    pub async fn reset_escalation_state(&self, node_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE drone_health
            SET escalation_level = 0, escalation_attempts = 0, last_escalation_at = NULL
            WHERE node_id = ?
            "#,
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the latest probe result JSON.
    pub async fn store_probe_result(&self, node_id: &str, result_json: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drone_health (node_id, failures, last_probe_result, last_probe_at)
            VALUES (?, 0, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                last_probe_result = excluded.last_probe_result,
                last_probe_at = excluded.last_probe_at
            "#,
        )
        .bind(node_id)
        .bind(result_json)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
