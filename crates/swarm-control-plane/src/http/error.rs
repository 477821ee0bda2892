// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP error type and its JSON shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use swarm_core::CoreError;

/// JSON error payload: `{error, hint?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// What went wrong.
    pub error: String,
    /// How to fix the request, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// API error mapped to a status code and an [`ErrorBody`].
#[derive(Debug)]
pub enum ApiError {
    /// 400 with an optional hint.
    Validation {
        /// What was wrong with the input.
        message: String,
        /// How to fix it.
        hint: Option<String>,
    },
    /// 401.
    Auth,
    /// 404.
    NotFound(String),
    /// 409.
    Conflict(String),
    /// 500. Details are logged, not leaked.
    Internal(String),
}

impl ApiError {
    /// Validation error without a hint.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            hint: None,
        }
    }

    /// Validation error with a hint.
    pub fn validation_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation { message, hint } => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: message,
                    hint,
                },
            ),
            ApiError::Auth => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "Unauthorized".to_string(),
                    hint: Some("provide the X-Admin-Key header".to_string()),
                },
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: message,
                    hint: None,
                },
            ),
            ApiError::Conflict(message) => (
                StatusCode::CONFLICT,
                ErrorBody {
                    error: message,
                    hint: None,
                },
            ),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "Internal server error".to_string(),
                        hint: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => ApiError::NotFound(message),
            CoreError::Conflict(message) => ApiError::Conflict(message),
            CoreError::InvalidInput(message) => ApiError::validation(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(format!("serialization failed: {err}"))
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::Core(core) => core.into(),
            crate::error::Error::DroneNotFound(name) => {
                ApiError::NotFound(format!("Drone not found: {name}"))
            }
            crate::error::Error::InvalidRequest(message) => ApiError::validation(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;
