// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for swarm-core.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller supplied an invalid value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;
