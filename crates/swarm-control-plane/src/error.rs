// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the control plane.

use thiserror::Error;

/// Control-plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Core store or type error.
    #[error("{0}")]
    Core(#[from] swarm_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote command execution failed.
    #[error("Link error: {0}")]
    Link(#[from] crate::link::LinkError),

    /// A drone was not found.
    #[error("Drone not found: {0}")]
    DroneNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using control-plane [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort startup, mapped to process exit codes.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] swarm_core::config::ConfigError),

    /// The store could not be opened.
    #[error("Store open failed: {0}")]
    Store(swarm_core::CoreError),

    /// A listener could not bind its port.
    #[error("Failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),

    /// The admin key could not be loaded or persisted.
    #[error("Admin key misconfiguration: {0}")]
    AdminKey(String),

    /// A required runtime component was not supplied to the builder.
    #[error("Runtime builder misconfigured: {0} is required")]
    Builder(&'static str),
}

impl StartupError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::Store(_) => 3,
            StartupError::Bind(_, _) | StartupError::Builder(_) => 1,
            StartupError::AdminKey(_) => 4,
        }
    }
}
