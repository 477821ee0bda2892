// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue and build-history operations.
//!
//! The queue state machine lives here: `needed → delegated → received`,
//! with `blocked`/`failed` terminals and reclaim back to `needed`.
//! Assignment and completion both run status-guarded statements so two
//! racing callers can never double-delegate an item or accept a
//! completion from a drone that is no longer the assignee.

use serde::Serialize;
use sqlx::FromRow;
use tracing::warn;

use super::Store;
use crate::error::Result;
use crate::types::{normalize_atom, now_ts, CompletionResult, CompletionStatus};

/// One unit of work.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueItem {
    /// Row id (FIFO order).
    pub id: i64,
    /// Normalized package atom.
    pub package: String,
    /// Lifecycle state.
    pub status: String,
    /// Assignee drone id, when delegated.
    pub assigned_to: Option<String>,
    /// When the current assignment was made.
    pub assigned_at: Option<f64>,
    /// When the assignee was first observed actively building this item.
    pub building_since: Option<f64>,
    /// When the item reached a terminal state.
    pub completed_at: Option<f64>,
    /// Failures accumulated by this row.
    pub failure_count: i64,
    /// Last error detail.
    pub error_message: Option<String>,
    /// Owning session.
    pub session_id: Option<String>,
    /// Insertion time.
    pub created_at: f64,
}

/// Queue totals by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounts {
    /// Waiting for assignment.
    pub needed: i64,
    /// Currently assigned.
    pub delegated: i64,
    /// Completed successfully.
    pub received: i64,
    /// Blocked after repeated failures.
    pub blocked: i64,
    /// Terminally failed.
    pub failed: i64,
    /// Sum of all states.
    pub total: i64,
}

/// A row of build history.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BuildRecord {
    /// Row id.
    pub id: i64,
    /// Package atom.
    pub package: String,
    /// Reporting drone id.
    pub drone_id: Option<String>,
    /// Reporting drone name at completion time.
    pub drone_name: Option<String>,
    /// success / failed / returned / upload_failed.
    pub status: String,
    /// Build wall time in seconds.
    pub duration_seconds: f64,
    /// Error detail for failures.
    pub error_message: Option<String>,
    /// Owning session.
    pub session_id: Option<String>,
    /// Completion time.
    pub built_at: f64,
}

/// Aggregate build statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BuildStats {
    /// Attempts on record.
    pub total_builds: i64,
    /// Successful builds.
    pub successful: i64,
    /// Everything else.
    pub failed: i64,
    /// Success percentage.
    pub success_rate: f64,
    /// Mean successful build time.
    pub avg_duration_s: f64,
    /// Total successful build time.
    pub total_duration_s: f64,
    /// Per-drone breakdown.
    pub per_drone: Vec<DroneStats>,
}

/// Per-drone slice of [`BuildStats`].
#[derive(Debug, Clone, Serialize)]
pub struct DroneStats {
    /// Drone name at completion time.
    pub drone_name: String,
    /// Attempts.
    pub total: i64,
    /// Successes.
    pub successful: i64,
    /// Success percentage.
    pub success_rate: f64,
    /// Mean successful build time.
    pub avg_duration_s: f64,
}

/// Everything a completion changed, reported back to the scheduler.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// Acceptance decision.
    pub result: CompletionResult,
    /// Session owning the item, when accepted.
    pub session_id: Option<String>,
    /// Set when a failure pushed the item into `blocked`, with the number
    /// of distinct drones that have failed it.
    pub blocked_distinct_drones: Option<i64>,
}

/// Knobs the completion transaction needs from the config.
#[derive(Debug, Clone, Copy)]
pub struct CompletionPolicy {
    /// Failures from this many distinct drones block the package.
    pub distinct_drone_limit: i64,
    /// Per-row failure cap before blocking.
    pub max_package_failures: i64,
    /// Only failures newer than this count toward the distinct-drone rule.
    pub failure_window_secs: f64,
}

impl Store {
    /// Add packages to the queue, normalizing atoms and skipping any that
    /// already have an active (`needed`/`delegated`) row. Returns the
    /// packages actually added.
    pub async fn enqueue_packages(
        &self,
        packages: &[String],
        session_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut added = Vec::new();
        for raw in packages {
            let pkg = normalize_atom(raw);
            if pkg.is_empty() {
                continue;
            }
            let active: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM queue WHERE package = ? AND status IN ('needed', 'delegated') LIMIT 1",
            )
            .bind(&pkg)
            .fetch_optional(&self.pool)
            .await?;
            if active.is_some() {
                continue;
            }

            sqlx::query(
                "INSERT INTO queue (package, status, session_id, created_at) VALUES (?, 'needed', ?, ?)",
            )
            .bind(&pkg)
            .bind(session_id)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
            added.push(pkg);
        }
        Ok(added)
    }

    /// Queue totals, optionally scoped to one session.
    pub async fn queue_counts(&self, session_id: Option<&str>) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = match session_id {
            Some(sid) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM queue WHERE session_id = ? GROUP BY status",
                )
                .bind(sid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM queue GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "needed" => counts.needed = n,
                "delegated" => counts.delegated = n,
                "received" => counts.received = n,
                "blocked" => counts.blocked = n,
                "failed" => counts.failed = n,
                _ => {}
            }
            counts.total += n;
        }
        Ok(counts)
    }

    /// List queue items by status.
    pub async fn queue_items(&self, status: &str, limit: i64) -> Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            "SELECT * FROM queue WHERE status = ? ORDER BY id LIMIT ?",
        )
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Items currently delegated, optionally to one drone.
    pub async fn delegated_items(&self, drone_id: Option<&str>) -> Result<Vec<QueueItem>> {
        let items = match drone_id {
            Some(id) => {
                sqlx::query_as::<_, QueueItem>(
                    "SELECT * FROM queue WHERE status = 'delegated' AND assigned_to = ? ORDER BY assigned_at",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, QueueItem>(
                    "SELECT * FROM queue WHERE status = 'delegated' ORDER BY assigned_at",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(items)
    }

    /// Number of delegated items a drone holds (prefetch accounting).
    pub async fn delegated_count(&self, drone_id: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue WHERE status = 'delegated' AND assigned_to = ?",
        )
        .bind(drone_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Candidate `needed` items for a drone, excluding packages the drone
    /// already failed and packages failed by too many distinct drones
    /// inside the failure window. Packages another drone attempted and
    /// lost come first, then FIFO.
    pub async fn assignment_candidates(
        &self,
        drone_id: &str,
        distinct_drone_limit: i64,
        failure_window_secs: f64,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        let cutoff = now_ts() - failure_window_secs;
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT q.* FROM queue q
            WHERE q.status = 'needed'
              AND NOT EXISTS (
                    SELECT 1 FROM build_history h
                    WHERE h.drone_id = ?1 AND h.package = q.package
                      AND h.status NOT IN ('success', 'returned', 'upload_failed'))
              AND (SELECT COUNT(DISTINCT h2.drone_id) FROM build_history h2
                    WHERE h2.package = q.package
                      AND h2.status NOT IN ('success', 'returned', 'upload_failed')
                      AND h2.built_at > ?2) < ?3
            ORDER BY
                EXISTS (
                    SELECT 1 FROM build_history h3
                    WHERE h3.package = q.package AND h3.drone_id != ?1) DESC,
                q.id ASC
            LIMIT ?4
            "#,
        )
        .bind(drone_id)
        .bind(cutoff)
        .bind(distinct_drone_limit)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Atomically delegate a `needed` item to a drone. Returns false when
    /// another caller won the race.
    pub async fn try_assign(&self, queue_id: i64, drone_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'delegated', assigned_to = ?, assigned_at = ?, building_since = NULL
            WHERE id = ? AND status = 'needed'
            "#,
        )
        .bind(drone_id)
        .bind(now_ts())
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unblock-and-delegate a `blocked` item (sweeper path).
    pub async fn try_assign_blocked(&self, queue_id: i64, drone_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'delegated', assigned_to = ?, assigned_at = ?, building_since = NULL
            WHERE id = ? AND status = 'blocked'
            "#,
        )
        .bind(drone_id)
        .bind(now_ts())
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a delegated item from one drone to another (rebalance steal).
    pub async fn reassign_item(&self, queue_id: i64, from: &str, to: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET assigned_to = ?, assigned_at = ?, building_since = NULL
            WHERE id = ? AND assigned_to = ? AND status = 'delegated'
            "#,
        )
        .bind(to)
        .bind(now_ts())
        .bind(queue_id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Apply a completion report. The acceptance check (the reporter must
    /// be the current assignee of a non-terminal row) runs inside the same
    /// transaction as the state change; the commit is retried once on a
    /// transient failure before surfacing.
    pub async fn complete_package(
        &self,
        package: &str,
        drone_id: &str,
        drone_name: &str,
        status: CompletionStatus,
        duration_seconds: f64,
        error_message: Option<&str>,
        policy: CompletionPolicy,
    ) -> Result<CompletionOutcome> {
        for attempt in 0..2 {
            match self
                .complete_package_tx(
                    package,
                    drone_id,
                    drone_name,
                    status,
                    duration_seconds,
                    error_message,
                    policy,
                )
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt == 0 => {
                    warn!(package, error = %e, "Completion commit failed, retrying once");
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("completion retry loop always returns");
    }

    async fn complete_package_tx(
        &self,
        package: &str,
        drone_id: &str,
        drone_name: &str,
        status: CompletionStatus,
        duration_seconds: f64,
        error_message: Option<&str>,
        policy: CompletionPolicy,
    ) -> Result<CompletionOutcome> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, String, Option<String>, i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, status, assigned_to, failure_count, session_id
            FROM queue
            WHERE package = ? AND status IN ('needed', 'delegated')
            LIMIT 1
            "#,
        )
        .bind(package)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue_id, row_status, assigned_to, failure_count, session_id)) = row else {
            // No active row: either the item already reached a terminal
            // state or it was never queued. Nothing to change.
            let terminal: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM queue WHERE package = ? LIMIT 1")
                    .bind(package)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.commit().await?;
            let result = if terminal.is_some() {
                CompletionResult::AlreadyTerminal
            } else {
                CompletionResult::Stale
            };
            return Ok(CompletionOutcome {
                result,
                session_id: None,
                blocked_distinct_drones: None,
            });
        };

        if row_status != "delegated" || assigned_to.as_deref() != Some(drone_id) {
            tx.commit().await?;
            return Ok(CompletionOutcome {
                result: CompletionResult::Stale,
                session_id: None,
                blocked_distinct_drones: None,
            });
        }

        let mut blocked_distinct = None;
        match status {
            CompletionStatus::Success => {
                sqlx::query(
                    r#"
                    UPDATE queue
                    SET status = 'received', completed_at = ?, failure_count = 0,
                        error_message = NULL, building_since = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(now)
                .bind(queue_id)
                .execute(&mut *tx)
                .await?;
            }
            CompletionStatus::Returned | CompletionStatus::UploadFailed => {
                // Not the package's fault: back to the queue, no failure
                // recorded against the item.
                sqlx::query(
                    r#"
                    UPDATE queue
                    SET status = 'needed', assigned_to = NULL, assigned_at = NULL,
                        building_since = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(queue_id)
                .execute(&mut *tx)
                .await?;
            }
            CompletionStatus::Failed => {
                let new_count = failure_count + 1;

                // History row first so the distinct-drone count sees this
                // failure too.
                insert_history(
                    &mut tx,
                    package,
                    drone_id,
                    drone_name,
                    status.as_str(),
                    duration_seconds,
                    error_message,
                    session_id.as_deref(),
                    now,
                )
                .await?;

                let cutoff = now - policy.failure_window_secs;
                let (distinct,): (i64,) = sqlx::query_as(
                    r#"
                    SELECT COUNT(DISTINCT drone_id) FROM build_history
                    WHERE package = ?
                      AND status NOT IN ('success', 'returned', 'upload_failed')
                      AND built_at > ?
                    "#,
                )
                .bind(package)
                .bind(cutoff)
                .fetch_one(&mut *tx)
                .await?;

                if distinct >= policy.distinct_drone_limit
                    || new_count >= policy.max_package_failures
                {
                    let reason = if distinct >= policy.distinct_drone_limit {
                        blocked_distinct = Some(distinct);
                        format!("Failed on {distinct} different drones")
                    } else {
                        format!("Failed {new_count} times")
                    };
                    sqlx::query(
                        r#"
                        UPDATE queue
                        SET status = 'blocked', failure_count = ?, error_message = ?,
                            assigned_to = NULL, assigned_at = NULL, building_since = NULL
                        WHERE id = ?
                        "#,
                    )
                    .bind(new_count)
                    .bind(&reason)
                    .bind(queue_id)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    sqlx::query(
                        r#"
                        UPDATE queue
                        SET status = 'needed', failure_count = ?, error_message = ?,
                            assigned_to = NULL, assigned_at = NULL, building_since = NULL
                        WHERE id = ?
                        "#,
                    )
                    .bind(new_count)
                    .bind(error_message)
                    .bind(queue_id)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;
                return Ok(CompletionOutcome {
                    result: CompletionResult::Accepted,
                    session_id,
                    blocked_distinct_drones: blocked_distinct,
                });
            }
        }

        insert_history(
            &mut tx,
            package,
            drone_id,
            drone_name,
            status.as_str(),
            duration_seconds,
            error_message,
            session_id.as_deref(),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(CompletionOutcome {
            result: CompletionResult::Accepted,
            session_id,
            blocked_distinct_drones: None,
        })
    }

    /// Reclaim a delegated item back to `needed`.
    pub async fn reclaim_package(&self, package: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'needed', assigned_to = NULL, assigned_at = NULL, building_since = NULL
            WHERE package = ? AND status = 'delegated'
            "#,
        )
        .bind(package)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reclaim every delegated item (admin rebalance action).
    pub async fn reclaim_all_delegated(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'needed', assigned_to = NULL, assigned_at = NULL, building_since = NULL
            WHERE status = 'delegated'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Unblock one package, clearing its failure count.
    pub async fn unblock_package(&self, package: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'needed', failure_count = 0, error_message = NULL, assigned_to = NULL
            WHERE package = ? AND status IN ('blocked', 'failed')
            "#,
        )
        .bind(package)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Manually block a package.
    pub async fn block_package(&self, package: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'blocked', error_message = 'manually blocked'
            WHERE package = ? AND status NOT IN ('received', 'blocked')
            "#,
        )
        .bind(package)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unblock all blocked packages.
    pub async fn unblock_all(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'needed', failure_count = 0, error_message = NULL, assigned_to = NULL
            WHERE status = 'blocked'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Clear blocked and failed items back to `needed`.
    pub async fn clear_failures(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'needed', failure_count = 0, error_message = NULL, assigned_to = NULL
            WHERE status IN ('blocked', 'failed')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reset all non-received items to `needed`, optionally scoped to one
    /// session.
    pub async fn reset_queue(&self, session_id: Option<&str>) -> Result<u64> {
        let sql_tail = r#"
            SET status = 'needed', assigned_to = NULL, assigned_at = NULL,
                building_since = NULL, completed_at = NULL, failure_count = 0,
                error_message = NULL
        "#;
        let result = match session_id {
            Some(sid) => {
                sqlx::query(&format!(
                    "UPDATE queue {sql_tail} WHERE session_id = ? AND status != 'received'"
                ))
                .bind(sid)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("UPDATE queue {sql_tail} WHERE status != 'received'"))
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Auto-retry blocked packages whose most recent attempt is older than
    /// `cutoff`.
    pub async fn unblock_aged(&self, cutoff: f64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'needed', failure_count = 0, assigned_to = NULL, error_message = NULL
            WHERE status = 'blocked'
              AND (SELECT MAX(h.built_at) FROM build_history h WHERE h.package = queue.package) < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Stamp `building_since` when a heartbeat shows the assignee actively
    /// building one of its delegated packages. First observation wins.
    pub async fn mark_building(&self, package: &str, drone_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET building_since = ?
            WHERE package = ? AND assigned_to = ? AND status = 'delegated'
              AND building_since IS NULL
            "#,
        )
        .bind(now_ts())
        .bind(package)
        .bind(drone_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Build history ─────────────────────────────────────────────────

    /// Build history, newest first, with optional status/drone filters.
    pub async fn build_history(
        &self,
        limit: i64,
        status: Option<&str>,
        drone: Option<&str>,
    ) -> Result<Vec<BuildRecord>> {
        let mut sql = String::from("SELECT * FROM build_history WHERE 1=1");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if drone.is_some() {
            sql.push_str(" AND (drone_id = ? OR drone_name = ?)");
        }
        sql.push_str(" ORDER BY built_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, BuildRecord>(&sql);
        if let Some(s) = status {
            query = query.bind(s);
        }
        if let Some(d) = drone {
            query = query.bind(d).bind(d);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Aggregate build statistics, optionally scoped to one session.
    pub async fn build_stats(&self, session_id: Option<&str>) -> Result<BuildStats> {
        let (where_clause, bind_session) = match session_id {
            Some(_) => ("WHERE session_id = ?", true),
            None => ("", false),
        };

        let sql = format!(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(CASE WHEN status = 'success' AND duration_seconds > 0
                                  THEN duration_seconds END), 0.0),
                COALESCE(SUM(CASE WHEN status = 'success' AND duration_seconds > 0
                                  THEN duration_seconds ELSE 0 END), 0.0)
            FROM build_history {where_clause}
            "#
        );
        let mut query = sqlx::query_as::<_, (i64, i64, f64, f64)>(&sql);
        if bind_session {
            query = query.bind(session_id);
        }
        let (total, successful, avg_duration, total_duration) =
            query.fetch_one(&self.pool).await?;

        let per_sql = format!(
            r#"
            SELECT drone_name,
                   COUNT(*),
                   COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                   COALESCE(AVG(CASE WHEN status = 'success' AND duration_seconds > 0
                                     THEN duration_seconds END), 0.0)
            FROM build_history {where_clause}
            GROUP BY drone_name
            ORDER BY COUNT(*) DESC
            "#
        );
        let mut per_query = sqlx::query_as::<_, (Option<String>, i64, i64, f64)>(&per_sql);
        if bind_session {
            per_query = per_query.bind(session_id);
        }
        let per_drone = per_query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|(drone_name, drone_total, drone_success, drone_avg)| DroneStats {
                drone_name: drone_name.unwrap_or_default(),
                total: drone_total,
                successful: drone_success,
                success_rate: if drone_total > 0 {
                    (drone_success as f64 / drone_total as f64 * 1000.0).round() / 10.0
                } else {
                    0.0
                },
                avg_duration_s: (drone_avg * 10.0).round() / 10.0,
            })
            .collect();

        Ok(BuildStats {
            total_builds: total,
            successful,
            failed: total - successful,
            success_rate: if total > 0 {
                (successful as f64 / total as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            },
            avg_duration_s: (avg_duration * 10.0).round() / 10.0,
            total_duration_s: (total_duration * 10.0).round() / 10.0,
            per_drone,
        })
    }

    /// Success/failure totals for one drone (dashboard columns).
    pub async fn drone_build_counts(&self, drone_id: &str) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
            FROM build_history WHERE drone_id = ?
            "#,
        )
        .bind(drone_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Whether this drone has a real build failure on record for this
    /// package (upload failures are infrastructure, not package, problems).
    pub async fn has_drone_failed_package(&self, drone_id: &str, package: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM build_history
            WHERE drone_id = ? AND package = ?
              AND status NOT IN ('success', 'returned', 'upload_failed')
            LIMIT 1
            "#,
        )
        .bind(drone_id)
        .bind(package)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Distinct drones with a failure for this package inside the window.
    pub async fn distinct_drone_failures(&self, package: &str, cutoff: f64) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT drone_id) FROM build_history
            WHERE package = ?
              AND status NOT IN ('success', 'returned', 'upload_failed')
              AND built_at > ?
            "#,
        )
        .bind(package)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    package: &str,
    drone_id: &str,
    drone_name: &str,
    status: &str,
    duration_seconds: f64,
    error_message: Option<&str>,
    session_id: Option<&str>,
    built_at: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO build_history
            (package, drone_id, drone_name, status, duration_seconds,
             error_message, session_id, built_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(package)
    .bind(drone_id)
    .bind(drone_name)
    .bind(status)
    .bind(duration_seconds)
    .bind(error_message)
    .bind(session_id)
    .bind(built_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CompletionPolicy {
        CompletionPolicy {
            distinct_drone_limit: 2,
            max_package_failures: 5,
            failure_window_secs: 1800.0,
        }
    }

    async fn store_with_item(pkg: &str) -> (Store, i64) {
        let store = Store::open_in_memory().await.unwrap();
        let added = store
            .enqueue_packages(&[pkg.to_string()], None)
            .await
            .unwrap();
        assert_eq!(added.len(), 1);
        let items = store.queue_items("needed", 10).await.unwrap();
        (store, items[0].id)
    }

    #[tokio::test]
    async fn enqueue_normalizes_and_dedups() {
        let store = Store::open_in_memory().await.unwrap();
        let added = store
            .enqueue_packages(
                &[
                    "dev-libs/openssl-3.2.0".to_string(),
                    "=dev-libs/openssl-3.2.0".to_string(),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(added, vec!["=dev-libs/openssl-3.2.0".to_string()]);

        let counts = store.queue_counts(None).await.unwrap();
        assert_eq!(counts.needed, 1);
        assert_eq!(counts.total, 1);
    }

    #[tokio::test]
    async fn resubmitting_an_active_package_is_a_noop() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();

        let added = store
            .enqueue_packages(&["dev-libs/foo-1.0".to_string()], None)
            .await
            .unwrap();
        assert!(added.is_empty());
        assert_eq!(store.queue_counts(None).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn try_assign_is_single_winner() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        assert!(store.try_assign(id, "d1").await.unwrap());
        assert!(!store.try_assign(id, "d2").await.unwrap());

        let items = store.delegated_items(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].assigned_to.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn success_completion_is_recorded() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();

        let outcome = store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Success,
                10.0,
                None,
                policy(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, CompletionResult::Accepted);

        let counts = store.queue_counts(None).await.unwrap();
        assert_eq!(counts.received, 1);

        let history = store.build_history(10, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "success");
        assert_eq!(history[0].duration_seconds, 10.0);
    }

    #[tokio::test]
    async fn completion_from_non_assignee_is_stale() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();

        let outcome = store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d2",
                "drone-two",
                CompletionStatus::Failed,
                5.0,
                Some("boom"),
                policy(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, CompletionResult::Stale);

        // Queue row untouched, no failure history written.
        let items = store.delegated_items(None).await.unwrap();
        assert_eq!(items[0].assigned_to.as_deref(), Some("d1"));
        assert!(store.build_history(10, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_after_reclaim_is_stale() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();
        assert!(store.reclaim_package("=dev-libs/foo-1.0").await.unwrap());

        let outcome = store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Failed,
                5.0,
                Some("boom"),
                policy(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, CompletionResult::Stale);

        let counts = store.queue_counts(None).await.unwrap();
        assert_eq!(counts.needed, 1);
        assert!(store.build_history(10, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_on_terminal_item_reports_already_terminal() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();
        store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Success,
                1.0,
                None,
                policy(),
            )
            .await
            .unwrap();

        let outcome = store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Success,
                1.0,
                None,
                policy(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, CompletionResult::AlreadyTerminal);
    }

    #[tokio::test]
    async fn two_distinct_drone_failures_block_the_package() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;

        store.try_assign(id, "d1").await.unwrap();
        let outcome = store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Failed,
                5.0,
                Some("boom"),
                policy(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, CompletionResult::Accepted);
        assert_eq!(outcome.blocked_distinct_drones, None);

        // Back to needed; a second drone picks it up and also fails.
        let items = store.queue_items("needed", 10).await.unwrap();
        store.try_assign(items[0].id, "d2").await.unwrap();
        let outcome = store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d2",
                "drone-two",
                CompletionStatus::Failed,
                5.0,
                Some("boom"),
                policy(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, CompletionResult::Accepted);
        assert_eq!(outcome.blocked_distinct_drones, Some(2));

        let counts = store.queue_counts(None).await.unwrap();
        assert_eq!(counts.blocked, 1);
    }

    #[tokio::test]
    async fn returned_goes_back_to_needed_without_failure() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();

        let outcome = store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Returned,
                0.0,
                None,
                policy(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, CompletionResult::Accepted);

        let items = store.queue_items("needed", 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].failure_count, 0);

        let history = store.build_history(10, None, None).await.unwrap();
        assert_eq!(history[0].status, "returned");
    }

    #[tokio::test]
    async fn candidates_exclude_previously_failed_drone() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .enqueue_packages(
                &["dev-libs/foo-1.0".to_string(), "dev-libs/bar-1.0".to_string()],
                None,
            )
            .await
            .unwrap();

        // d1 fails foo once; foo goes back to needed.
        let items = store.queue_items("needed", 10).await.unwrap();
        let foo = items.iter().find(|i| i.package.contains("foo")).unwrap();
        store.try_assign(foo.id, "d1").await.unwrap();
        store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Failed,
                5.0,
                Some("boom"),
                policy(),
            )
            .await
            .unwrap();

        let candidates = store
            .assignment_candidates("d1", 2, 1800.0, 10)
            .await
            .unwrap();
        assert!(candidates.iter().all(|c| !c.package.contains("foo")));

        // A different drone sees foo first: another drone attempted and
        // lost it, so it outranks the untouched bar.
        let candidates = store
            .assignment_candidates("d2", 2, 1800.0, 10)
            .await
            .unwrap();
        assert_eq!(candidates[0].package, "=dev-libs/foo-1.0");
    }

    #[tokio::test]
    async fn unblock_aged_retries_old_blocks() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();
        // Block it manually and age the history by completing a failure.
        store
            .complete_package(
                "=dev-libs/foo-1.0",
                "d1",
                "drone-one",
                CompletionStatus::Failed,
                5.0,
                Some("boom"),
                policy(),
            )
            .await
            .unwrap();
        store.block_package("=dev-libs/foo-1.0").await.unwrap();

        // Cutoff in the future: the single failure is older than it.
        let aged = store.unblock_aged(now_ts() + 10.0).await.unwrap();
        assert_eq!(aged, 1);
        assert_eq!(store.queue_counts(None).await.unwrap().needed, 1);
    }

    #[tokio::test]
    async fn mark_building_only_stamps_own_assignment() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();

        assert!(!store.mark_building("=dev-libs/foo-1.0", "d2").await.unwrap());
        assert!(store.mark_building("=dev-libs/foo-1.0", "d1").await.unwrap());
        // Second stamp is a no-op.
        assert!(!store.mark_building("=dev-libs/foo-1.0", "d1").await.unwrap());
    }

    #[tokio::test]
    async fn reassign_moves_item_between_drones() {
        let (store, id) = store_with_item("dev-libs/foo-1.0").await;
        store.try_assign(id, "d1").await.unwrap();

        assert!(store.reassign_item(id, "d1", "d2").await.unwrap());
        assert!(!store.reassign_item(id, "d1", "d3").await.unwrap());

        let items = store.delegated_items(Some("d2")).await.unwrap();
        assert_eq!(items.len(), 1);
    }
}
