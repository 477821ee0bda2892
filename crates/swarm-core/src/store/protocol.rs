// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol log persistence: one row per completed HTTP exchange.

use serde::Serialize;
use sqlx::FromRow;

use super::Store;
use crate::error::{CoreError, Result};
use crate::types::now_ts;

/// A captured request/response pair ready for insertion.
#[derive(Debug, Clone, Default)]
pub struct ProtocolEntry {
    /// Completion time.
    pub timestamp: f64,
    /// Peer address.
    pub source_ip: Option<String>,
    /// Resolved drone name, when the request identified one.
    pub source_node: Option<String>,
    /// HTTP method.
    pub method: String,
    /// Path without query string.
    pub path: String,
    /// Classification tag.
    pub msg_type: String,
    /// Drone id parsed from the exchange.
    pub drone_id: Option<String>,
    /// Package parsed from the exchange.
    pub package: Option<String>,
    /// Session id parsed from the exchange.
    pub session_id: Option<String>,
    /// Response status code.
    pub status_code: i64,
    /// One-line request description.
    pub request_summary: Option<String>,
    /// One-line response description.
    pub response_summary: Option<String>,
    /// Size-capped request body.
    pub request_body: Option<String>,
    /// Size-capped response body.
    pub response_body: Option<String>,
    /// Handler latency in milliseconds.
    pub latency_ms: f64,
    /// Response body length before capping.
    pub content_length: i64,
}

/// A stored protocol row (summaries only; bodies via [`Store::protocol_detail`]).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProtocolRow {
    /// Row id.
    pub id: i64,
    /// Completion time.
    pub timestamp: f64,
    /// Peer address.
    pub source_ip: Option<String>,
    /// Resolved drone name.
    pub source_node: Option<String>,
    /// HTTP method.
    pub method: String,
    /// Path.
    pub path: String,
    /// Classification tag.
    pub msg_type: String,
    /// Drone id hint.
    pub drone_id: Option<String>,
    /// Package hint.
    pub package: Option<String>,
    /// Session hint.
    pub session_id: Option<String>,
    /// Status code.
    pub status_code: i64,
    /// Request summary.
    pub request_summary: Option<String>,
    /// Response summary.
    pub response_summary: Option<String>,
    /// Latency in milliseconds.
    pub latency_ms: f64,
    /// Uncapped response length.
    pub content_length: i64,
}

/// Full row including captured bodies.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProtocolDetail {
    /// Row id.
    pub id: i64,
    /// Completion time.
    pub timestamp: f64,
    /// Peer address.
    pub source_ip: Option<String>,
    /// Resolved drone name.
    pub source_node: Option<String>,
    /// HTTP method.
    pub method: String,
    /// Path.
    pub path: String,
    /// Classification tag.
    pub msg_type: String,
    /// Drone id hint.
    pub drone_id: Option<String>,
    /// Package hint.
    pub package: Option<String>,
    /// Session hint.
    pub session_id: Option<String>,
    /// Status code.
    pub status_code: i64,
    /// Request summary.
    pub request_summary: Option<String>,
    /// Response summary.
    pub response_summary: Option<String>,
    /// Captured request body.
    pub request_body: Option<String>,
    /// Captured response body.
    pub response_body: Option<String>,
    /// Latency in milliseconds.
    pub latency_ms: f64,
    /// Uncapped response length.
    pub content_length: i64,
}

/// Traffic summary over the protocol log.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStats {
    /// Total captured exchanges.
    pub total: i64,
    /// Per-message-type breakdown, busiest first.
    pub by_type: Vec<ProtocolTypeStats>,
}

/// One message type's slice of [`ProtocolStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolTypeStats {
    /// Classification tag.
    pub msg_type: String,
    /// Exchanges captured.
    pub count: i64,
    /// Mean handler latency.
    pub avg_latency_ms: f64,
    /// Worst handler latency.
    pub max_latency_ms: f64,
}

/// System state reconstructed from captured responses.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolSnapshot {
    /// The point in time asked for.
    pub timestamp: f64,
    /// Last captured status response at or before that time.
    pub status: serde_json::Value,
    /// Last captured node listing at or before that time.
    pub nodes: serde_json::Value,
}

impl Store {
    /// Batch-insert protocol entries from the write-behind queue.
    pub async fn insert_protocol_entries(&self, entries: &[ProtocolEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for e in entries {
            sqlx::query(
                r#"
                INSERT INTO protocol_log
                    (timestamp, source_ip, source_node, method, path, msg_type,
                     drone_id, package, session_id, status_code,
                     request_summary, response_summary, request_body, response_body,
                     latency_ms, content_length)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(e.timestamp)
            .bind(&e.source_ip)
            .bind(&e.source_node)
            .bind(&e.method)
            .bind(&e.path)
            .bind(&e.msg_type)
            .bind(&e.drone_id)
            .bind(&e.package)
            .bind(&e.session_id)
            .bind(e.status_code)
            .bind(&e.request_summary)
            .bind(&e.response_summary)
            .bind(&e.request_body)
            .bind(&e.response_body)
            .bind(e.latency_ms)
            .bind(e.content_length)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Query protocol rows with optional filters, ascending by id.
    pub async fn protocol_entries(
        &self,
        since_id: i64,
        msg_type: Option<&str>,
        drone_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ProtocolRow>> {
        let mut sql = String::from(
            r#"
            SELECT id, timestamp, source_ip, source_node, method, path, msg_type,
                   drone_id, package, session_id, status_code,
                   request_summary, response_summary, latency_ms, content_length
            FROM protocol_log WHERE id > ?
            "#,
        );
        if msg_type.is_some() {
            sql.push_str(" AND msg_type = ?");
        }
        if drone_id.is_some() {
            sql.push_str(" AND drone_id = ?");
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?");

        let mut query = sqlx::query_as::<_, ProtocolRow>(&sql).bind(since_id);
        if let Some(t) = msg_type {
            query = query.bind(t);
        }
        if let Some(d) = drone_id {
            query = query.bind(d);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Full protocol row including captured bodies.
    pub async fn protocol_detail(&self, id: i64) -> Result<Option<ProtocolDetail>> {
        let row = sqlx::query_as::<_, ProtocolDetail>("SELECT * FROM protocol_log WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Traffic summary grouped by message type.
    pub async fn protocol_stats(&self, since: Option<f64>) -> Result<ProtocolStats> {
        let rows: Vec<(String, i64, f64, f64)> = match since {
            Some(ts) => {
                sqlx::query_as(
                    r#"
                    SELECT msg_type, COUNT(*),
                           COALESCE(AVG(latency_ms), 0.0),
                           COALESCE(MAX(latency_ms), 0.0)
                    FROM protocol_log
                    WHERE timestamp > ?
                    GROUP BY msg_type
                    ORDER BY COUNT(*) DESC
                    "#,
                )
                .bind(ts)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT msg_type, COUNT(*),
                           COALESCE(AVG(latency_ms), 0.0),
                           COALESCE(MAX(latency_ms), 0.0)
                    FROM protocol_log
                    GROUP BY msg_type
                    ORDER BY COUNT(*) DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let by_type: Vec<ProtocolTypeStats> = rows
            .into_iter()
            .map(|(msg_type, count, avg_latency_ms, max_latency_ms)| ProtocolTypeStats {
                msg_type,
                count,
                avg_latency_ms,
                max_latency_ms,
            })
            .collect();
        Ok(ProtocolStats {
            total: by_type.iter().map(|t| t.count).sum(),
            by_type,
        })
    }

    /// Activity histogram between `start` and `end`, for replay-scrubber
    /// waveforms. Empty buckets read as zero.
    pub async fn protocol_density(
        &self,
        start: f64,
        end: f64,
        buckets: usize,
    ) -> Result<Vec<i64>> {
        if buckets == 0 || end <= start {
            return Err(CoreError::InvalidInput(
                "density needs buckets > 0 and end > start".to_string(),
            ));
        }
        let bucket_width = (end - start) / buckets as f64;

        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT CAST((timestamp - ?) / ? AS INT), COUNT(*)
            FROM protocol_log
            WHERE timestamp BETWEEN ? AND ?
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(start)
        .bind(bucket_width)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut density = vec![0i64; buckets];
        for (bucket, count) in rows {
            if (0..buckets as i64).contains(&bucket) {
                density[bucket as usize] = count;
            }
        }
        Ok(density)
    }

    /// Reconstruct system state at `timestamp` from the most recent
    /// status and node-list response bodies captured before it.
    pub async fn protocol_state_at(&self, timestamp: f64) -> Result<ProtocolSnapshot> {
        let status = self.last_capture_before("status_query", timestamp).await?;
        let nodes = self.last_capture_before("node_list", timestamp).await?;
        Ok(ProtocolSnapshot {
            timestamp,
            status,
            nodes,
        })
    }

    async fn last_capture_before(
        &self,
        msg_type: &str,
        timestamp: f64,
    ) -> Result<serde_json::Value> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT response_body FROM protocol_log
            WHERE msg_type = ? AND timestamp <= ?
            ORDER BY timestamp DESC LIMIT 1
            "#,
        )
        .bind(msg_type)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .and_then(|(body,)| body)
            .and_then(|body| serde_json::from_str(&body).ok())
            .unwrap_or(serde_json::Value::Null))
    }

    /// Delete protocol rows older than `max_age_secs`.
    pub async fn prune_protocol_log(&self, max_age_secs: f64) -> Result<u64> {
        let cutoff = now_ts() - max_age_secs;
        let result = sqlx::query("DELETE FROM protocol_log WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(msg_type: &str, status: i64) -> ProtocolEntry {
        ProtocolEntry {
            timestamp: now_ts(),
            source_ip: Some("10.0.0.7".to_string()),
            method: "POST".to_string(),
            path: "/api/v1/complete".to_string(),
            msg_type: msg_type.to_string(),
            status_code: status,
            drone_id: Some("d1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_query_and_detail() {
        let store = Store::open_in_memory().await.unwrap();
        let mut with_body = entry("complete", 200);
        with_body.request_body = Some(r#"{"id":"d1"}"#.to_string());
        store
            .insert_protocol_entries(&[with_body, entry("work_request", 200)])
            .await
            .unwrap();

        let rows = store.protocol_entries(0, None, None, 100).await.unwrap();
        assert_eq!(rows.len(), 2);

        let filtered = store
            .protocol_entries(0, Some("complete"), Some("d1"), 100)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);

        let detail = store.protocol_detail(rows[0].id).await.unwrap().unwrap();
        assert_eq!(detail.request_body.as_deref(), Some(r#"{"id":"d1"}"#));
    }

    #[tokio::test]
    async fn stats_group_by_message_type() {
        let store = Store::open_in_memory().await.unwrap();
        let mut slow = entry("work_request", 200);
        slow.latency_ms = 40.0;
        let mut fast = entry("work_request", 200);
        fast.latency_ms = 10.0;
        store
            .insert_protocol_entries(&[slow, fast, entry("complete", 200)])
            .await
            .unwrap();

        let stats = store.protocol_stats(None).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type[0].msg_type, "work_request");
        assert_eq!(stats.by_type[0].count, 2);
        assert_eq!(stats.by_type[0].avg_latency_ms, 25.0);
        assert_eq!(stats.by_type[0].max_latency_ms, 40.0);

        // The since filter hides everything older than the cutoff.
        let stats = store.protocol_stats(Some(now_ts() + 10.0)).await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn density_fills_empty_buckets_with_zero() {
        let store = Store::open_in_memory().await.unwrap();
        let start = now_ts();

        // Two exchanges in the first second, one in the third.
        let mut batch = Vec::new();
        for offset in [0.1, 0.2, 2.5] {
            let mut e = entry("work_request", 200);
            e.timestamp = start + offset;
            batch.push(e);
        }
        store.insert_protocol_entries(&batch).await.unwrap();

        let density = store.protocol_density(start, start + 4.0, 4).await.unwrap();
        assert_eq!(density, vec![2, 0, 1, 0]);

        let err = store.protocol_density(start, start, 4).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn state_at_replays_latest_captured_snapshots() {
        let store = Store::open_in_memory().await.unwrap();
        let t0 = now_ts();

        let mut old_status = entry("status_query", 200);
        old_status.timestamp = t0;
        old_status.response_body = Some(r#"{"needed": 5}"#.to_string());
        let mut new_status = entry("status_query", 200);
        new_status.timestamp = t0 + 60.0;
        new_status.response_body = Some(r#"{"needed": 2}"#.to_string());
        let mut nodes = entry("node_list", 200);
        nodes.timestamp = t0 + 30.0;
        nodes.response_body = Some(r#"[{"name": "drone-one"}]"#.to_string());
        store
            .insert_protocol_entries(&[old_status, new_status, nodes])
            .await
            .unwrap();

        // Between the two status captures only the first is visible.
        let snapshot = store.protocol_state_at(t0 + 45.0).await.unwrap();
        assert_eq!(snapshot.status["needed"], 5);
        assert_eq!(snapshot.nodes[0]["name"], "drone-one");

        let snapshot = store.protocol_state_at(t0 + 90.0).await.unwrap();
        assert_eq!(snapshot.status["needed"], 2);

        // Before any capture everything reads as null.
        let snapshot = store.protocol_state_at(t0 - 10.0).await.unwrap();
        assert!(snapshot.status.is_null());
        assert!(snapshot.nodes.is_null());
    }

    #[tokio::test]
    async fn prune_removes_old_entries() {
        let store = Store::open_in_memory().await.unwrap();
        let mut old = entry("complete", 200);
        old.timestamp = now_ts() - 100_000.0;
        store.insert_protocol_entries(&[old, entry("complete", 200)]).await.unwrap();

        let pruned = store.prune_protocol_log(86_400.0).await.unwrap();
        assert_eq!(pruned, 1);
    }
}
