// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed state store.
//!
//! All durable state lives in one WAL-mode database file. SQLite gives the
//! single-writer/concurrent-reader discipline the control plane relies on;
//! cross-entity invariants (assignment, completion acceptance) run inside
//! explicit transactions in [`queue`].
//!
//! Schema management is deliberately non-destructive: the base schema is
//! applied with `CREATE TABLE IF NOT EXISTS` on every open, and columns
//! added after a release shipped are created by probing `PRAGMA
//! table_info`, so an existing database is always upgraded in place.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::now_ts;

pub mod drone_config;
pub mod events;
pub mod explorer;
pub mod health;
pub mod nodes;
pub mod payloads;
pub mod protocol;
pub mod queue;
pub mod releases;
pub mod sessions;

static SCHEMA: &str = include_str!("../../migrations/schema.sql");

/// Columns added after the base schema shipped. Applied on every open;
/// each entry is created only if `PRAGMA table_info` does not list it.
const COLUMN_MIGRATIONS: &[(&str, &str, &str)] = &[
    ("nodes", "last_ping_at", "REAL"),
    ("nodes", "last_pong_at", "REAL"),
    ("nodes", "ping_latency_ms", "REAL"),
    ("queue", "building_since", "REAL"),
    ("drone_health", "upload_failures", "INTEGER NOT NULL DEFAULT 0"),
    ("drone_health", "last_upload_failure", "REAL"),
    ("drone_health", "escalation_level", "INTEGER NOT NULL DEFAULT 0"),
    ("drone_health", "last_escalation_at", "REAL"),
    ("drone_health", "escalation_attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("drone_health", "last_probe_result", "TEXT"),
    ("drone_health", "last_probe_at", "REAL"),
];

/// Handle to the state database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Wrap an existing pool. Assumes the schema is already in place.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. Single connection so every query
    /// sees the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        self.apply_column_migrations().await?;
        Ok(())
    }

    async fn apply_column_migrations(&self) -> Result<()> {
        for (table, column, decl) in COLUMN_MIGRATIONS {
            let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
                .fetch_all(&self.pool)
                .await?;
            let present = rows
                .iter()
                .any(|r| r.get::<String, _>("name").as_str() == *column);
            if !present {
                sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
                    .execute(&self.pool)
                    .await?;
                debug!(table, column, "Added missing column");
            }
        }
        Ok(())
    }

    // ── Runtime settings (key/value flags) ───────────────────────────

    /// Read a runtime setting.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Write a runtime setting.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the global queue pause flag is set.
    pub async fn is_paused(&self) -> Result<bool> {
        Ok(self.get_setting("paused").await?.as_deref() == Some("true"))
    }

    /// Database connectivity check.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Size of the database file in bytes, when backed by a file.
    pub async fn db_size_bytes(&self) -> Result<i64> {
        let (page_count, page_size): (i64, i64) = {
            let pc: i64 = sqlx::query_scalar("PRAGMA page_count")
                .fetch_one(&self.pool)
                .await?;
            let ps: i64 = sqlx::query_scalar("PRAGMA page_size")
                .fetch_one(&self.pool)
                .await?;
            (pc, ps)
        };
        Ok(page_count * page_size)
    }
}

pub(crate) fn not_found(what: impl Into<String>) -> CoreError {
    CoreError::NotFound(what.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_applies_schema() {
        let store = Store::open_in_memory().await.unwrap();
        store.health_check().await.unwrap();

        // A table from the base schema and a migrated column must both exist.
        let rows = sqlx::query("PRAGMA table_info(drone_health)")
            .fetch_all(store.pool())
            .await
            .unwrap();
        let cols: Vec<String> = rows.iter().map(|r| r.get("name")).collect();
        assert!(cols.contains(&"failures".to_string()));
        assert!(cols.contains(&"escalation_level".to_string()));
        assert!(cols.contains(&"last_probe_at".to_string()));
    }

    #[tokio::test]
    async fn schema_application_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.apply_schema().await.unwrap();
        store.apply_schema().await.unwrap();
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/swarm.db");
        let store = Store::open(&path).await.unwrap();
        store.health_check().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.get_setting("paused").await.unwrap(), None);
        assert!(!store.is_paused().await.unwrap());

        store.set_setting("paused", "true").await.unwrap();
        assert!(store.is_paused().await.unwrap());

        store.set_setting("paused", "false").await.unwrap();
        assert!(!store.is_paused().await.unwrap());
    }
}
