// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session (work batch) operations.

use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::Result;
use crate::types::now_ts;

/// A named batch of queue items submitted together.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Session {
    /// Session id (UUID).
    pub id: String,
    /// Optional human name.
    pub name: Option<String>,
    /// active / completed / aborted.
    pub status: String,
    /// Items submitted with the session.
    pub total_packages: i64,
    /// Items received.
    pub completed_packages: i64,
    /// Items blocked or failed.
    pub failed_packages: i64,
    /// Creation time.
    pub started_at: f64,
    /// Close time.
    pub completed_at: Option<f64>,
}

impl Store {
    /// Create a session. Returns its generated id.
    pub async fn create_session(&self, name: Option<&str>, total_packages: i64) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, status, total_packages, started_at)
            VALUES (?, ?, 'active', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(total_packages)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Fetch a session.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    /// The most recently started active session, if any.
    pub async fn active_session(&self) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE status = 'active' ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Recent sessions, newest first.
    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Recompute a session's totals from its queue rows, and close it when
    /// every member item is terminal. Returns true if the session was
    /// closed by this call.
    pub async fn rollup_session(&self, session_id: &str) -> Result<bool> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                completed_packages = (SELECT COUNT(*) FROM queue
                                      WHERE session_id = ?1 AND status = 'received'),
                failed_packages = (SELECT COUNT(*) FROM queue
                                   WHERE session_id = ?1 AND status IN ('blocked', 'failed'))
            WHERE id = ?1
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        let (open,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue WHERE session_id = ? AND status IN ('needed', 'delegated')",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        if open == 0 {
            let result = sqlx::query(
                r#"
                UPDATE sessions SET status = 'completed', completed_at = ?
                WHERE id = ? AND status = 'active'
                "#,
            )
            .bind(now_ts())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
            return Ok(result.rows_affected() > 0);
        }
        Ok(false)
    }

    /// Add to a session's total after enqueueing its items.
    pub async fn bump_session_total(&self, session_id: &str, added: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET total_packages = total_packages + ? WHERE id = ?")
            .bind(added)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Abort a session without waiting for its items.
    pub async fn abort_session(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET status = 'aborted', completed_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(now_ts())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
