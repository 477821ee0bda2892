// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent event history operations. The hot path goes through the
//! in-memory ring in [`crate::events`]; these rows are the durable tail.

use serde::Serialize;
use sqlx::FromRow;

use super::Store;
use crate::error::Result;
use crate::events::Event;
use crate::types::now_ts;

/// A persisted event row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EventRow {
    /// Row id.
    pub id: i64,
    /// Emission time.
    pub timestamp: f64,
    /// Event kind tag.
    pub event_type: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details JSON.
    pub details_json: Option<String>,
    /// Related drone name.
    pub drone: Option<String>,
    /// Related package atom.
    pub package: Option<String>,
}

impl Store {
    /// Batch-insert events from the write-behind queue.
    pub async fn insert_events(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (timestamp, event_type, message, details_json, drone, package)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.timestamp)
            .bind(&event.event_type)
            .bind(&event.message)
            .bind(event.details.as_ref().map(|d| d.to_string()))
            .bind(&event.drone)
            .bind(&event.package)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Query the persistent event history, oldest first.
    pub async fn event_history(
        &self,
        since_ts: Option<f64>,
        event_type: Option<&str>,
        drone: Option<&str>,
        limit: i64,
    ) -> Result<Vec<EventRow>> {
        let mut sql = String::from("SELECT * FROM events WHERE 1=1");
        if since_ts.is_some() {
            sql.push_str(" AND timestamp > ?");
        }
        if event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        if drone.is_some() {
            sql.push_str(" AND drone = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, EventRow>(&sql);
        if let Some(ts) = since_ts {
            query = query.bind(ts);
        }
        if let Some(t) = event_type {
            query = query.bind(t);
        }
        if let Some(d) = drone {
            query = query.bind(d);
        }
        let mut rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.reverse();
        Ok(rows)
    }

    /// Delete events older than `max_age_secs`.
    pub async fn prune_events(&self, max_age_secs: f64) -> Result<u64> {
        let cutoff = now_ts() - max_age_secs;
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
