// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restricted read-only SQL surface for the admin explorer.
//!
//! Only a single SELECT statement is ever executed: write verbs are
//! rejected by a token scan before the statement reaches SQLite, results
//! are row-capped, and the query runs under a timeout.

use std::time::Duration;

use serde::Serialize;
use sqlx::{Column, Row, TypeInfo};

use super::Store;
use crate::error::{CoreError, Result};

/// Hard cap on returned rows.
const MAX_ROWS: usize = 1000;

/// Per-query execution budget.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Verbs that must never appear in an explorer query.
const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "ATTACH", "DETACH", "PRAGMA",
    "REPLACE", "VACUUM", "REINDEX",
];

/// Result of an explorer query.
#[derive(Debug, Clone, Serialize)]
pub struct ExplorerResult {
    /// Column names in select order.
    pub columns: Vec<String>,
    /// Rows as JSON values.
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Number of rows returned (after capping).
    pub count: usize,
    /// Whether the row cap truncated the result.
    pub truncated: bool,
}

/// One user table with its row count.
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Current row count.
    pub row_count: i64,
}

/// One table's DDL.
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// `CREATE TABLE` statement.
    pub sql: Option<String>,
}

impl Store {
    /// User tables with row counts.
    pub async fn explorer_tables(&self) -> Result<Vec<TableInfo>> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            // Table names come from sqlite_master, not the caller.
            let (row_count,): (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM \"{name}\""))
                    .fetch_one(self.pool())
                    .await?;
            tables.push(TableInfo { name, row_count });
        }
        Ok(tables)
    }

    /// DDL for every user table.
    pub async fn explorer_schema(&self) -> Result<Vec<TableSchema>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, sql)| TableSchema { name, sql })
            .collect())
    }

    /// Run a restricted read-only query.
    pub async fn explorer_query(&self, query: &str) -> Result<ExplorerResult> {
        validate_query(query)?;

        let rows = tokio::time::timeout(
            QUERY_TIMEOUT,
            sqlx::query(query).fetch_all(self.pool()),
        )
        .await
        .map_err(|_| CoreError::InvalidInput("query exceeded the time budget".to_string()))?
        .map_err(|e| CoreError::InvalidInput(format!("query failed: {e}")))?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let truncated = rows.len() > MAX_ROWS;
        let mut out = Vec::with_capacity(rows.len().min(MAX_ROWS));
        for row in rows.iter().take(MAX_ROWS) {
            let mut values = Vec::with_capacity(row.columns().len());
            for (i, column) in row.columns().iter().enumerate() {
                values.push(column_to_json(row, i, column.type_info().name()));
            }
            out.push(values);
        }

        Ok(ExplorerResult {
            columns,
            count: out.len(),
            rows: out,
            truncated,
        })
    }
}

fn validate_query(query: &str) -> Result<()> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput("empty query".to_string()));
    }

    let upper = trimmed.to_uppercase();
    if !upper.starts_with("SELECT") {
        return Err(CoreError::InvalidInput(
            "only SELECT queries are allowed".to_string(),
        ));
    }

    // One statement only: a semicolon is tolerated solely as a trailer.
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    if body.contains(';') {
        return Err(CoreError::InvalidInput(
            "multiple statements are not allowed".to_string(),
        ));
    }

    for verb in FORBIDDEN {
        // Token match, so column names like `created_at` don't trip on CREATE.
        let hit = upper
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .any(|tok| tok == *verb);
        if hit {
            return Err(CoreError::InvalidInput(format!("{verb} is not allowed")));
        }
    }
    Ok(())
}

fn column_to_json(row: &sqlx::sqlite::SqliteRow, index: usize, type_name: &str) -> serde_json::Value {
    match type_name {
        "INTEGER" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "REAL" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "BLOB" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(|b| serde_json::Value::from(format!("<{} bytes>", b.len())))
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_works_and_returns_columns() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .enqueue_packages(&["dev-libs/foo-1.0".to_string()], None)
            .await
            .unwrap();

        let result = store
            .explorer_query("SELECT package, status FROM queue")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["package", "status"]);
        assert_eq!(result.count, 1);
        assert_eq!(result.rows[0][1], "needed");
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn write_verbs_are_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        for query in [
            "DELETE FROM queue",
            "SELECT 1; DELETE FROM queue",
            "INSERT INTO queue (package) VALUES ('x')",
            "SELECT * FROM queue; DROP TABLE queue",
            "PRAGMA journal_mode=DELETE",
        ] {
            let err = store.explorer_query(query).await.unwrap_err();
            assert!(matches!(err, CoreError::InvalidInput(_)), "{query}");
        }
    }

    #[tokio::test]
    async fn column_names_containing_verbs_are_fine() {
        let store = Store::open_in_memory().await.unwrap();
        // `created_at` contains "CREATE" as a substring but not a token.
        store
            .explorer_query("SELECT created_at FROM queue")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn trailing_semicolon_is_tolerated() {
        let store = Store::open_in_memory().await.unwrap();
        store.explorer_query("SELECT 1;").await.unwrap();
    }

    #[tokio::test]
    async fn tables_and_schema_list_user_tables() {
        let store = Store::open_in_memory().await.unwrap();
        let tables = store.explorer_tables().await.unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"queue"));
        assert!(names.contains(&"nodes"));

        let schema = store.explorer_schema().await.unwrap();
        let queue = schema.iter().find(|t| t.name == "queue").unwrap();
        assert!(queue.sql.as_deref().unwrap().contains("CREATE TABLE"));
    }
}
