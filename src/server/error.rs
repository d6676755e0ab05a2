// src/server/error.rs
// Error responses for the HTTP API

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::{error, warn};

use crate::error::PilotError;

/// JSON error body with a status code
#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status_code: StatusCode,
    pub error_code: Option<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
            error_code: Some("BAD_REQUEST".to_string()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: Some("INTERNAL_ERROR".to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<PilotError> for ApiError {
    fn from(err: PilotError) -> Self {
        let status_code =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        let error_code = match &err {
            PilotError::InvalidInput(_) => "BAD_REQUEST",
            PilotError::MissingCredential(_) => "UNAUTHORIZED",
            PilotError::NotFound(_) => "NOT_FOUND",
            PilotError::Upstream { status: 429, .. } => "RATE_LIMITED",
            PilotError::Upstream { .. } => "UPSTREAM_ERROR",
            PilotError::Cancelled => "CANCELLED",
            PilotError::Config(_) => "INTERNAL_ERROR",
            _ => "BAD_GATEWAY",
        };
        Self {
            message: err.to_string(),
            status_code,
            error_code: Some(error_code.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": true,
            "message": self.message,
            "status": self.status_code.as_u16()
        });
        if let Some(error_code) = self.error_code {
            body["error_code"] = json!(error_code);
        }

        if self.status_code.is_server_error() {
            error!(status = %self.status_code, message = %self.message, "API error");
        } else {
            warn!(status = %self.status_code, message = %self.message, "API error");
        }

        (self.status_code, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
