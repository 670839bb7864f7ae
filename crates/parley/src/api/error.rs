//! API error handling with structured responses.

use axum::{
    Json,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use parley_protocol::headers::{PRODUCER_EXPECTED_SEQ, PRODUCER_RECEIVED_SEQ, STREAM_CLOSED};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::AuthError;
use crate::error::ParleyError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The stream no longer accepts appends.
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// The producer's sequence diverged from the store's.
    #[error("Sequence mismatch: expected {expected}, received {received}")]
    SequenceMismatch { expected: u64, received: u64 },

    /// A log store error relayed with its original status.
    #[error("Log store error: {details}")]
    Upstream { status: StatusCode, details: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::StreamClosed(_) | Self::SequenceMismatch { .. } => {
                StatusCode::CONFLICT
            }
            Self::Upstream { status, .. } => *status,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::StreamClosed(_) => "STREAM_CLOSED",
            Self::SequenceMismatch { .. } => "SEQUENCE_MISMATCH",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            if status == StatusCode::SERVICE_UNAVAILABLE {
                warn!(error_code = code, message = %message, "Service unavailable");
            } else {
                error!(error_code = code, message = %message, "API error");
            }
        } else {
            tracing::debug!(error_code = code, message = %message, "Client error");
        }

        let details = match &self {
            Self::Upstream { details, .. } => Some(details.clone()),
            _ => None,
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: message,
                code,
                details,
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        match self {
            Self::SequenceMismatch { expected, received } => {
                headers.insert(
                    HeaderName::from_static(PRODUCER_EXPECTED_SEQ),
                    HeaderValue::from(expected),
                );
                headers.insert(
                    HeaderName::from_static(PRODUCER_RECEIVED_SEQ),
                    HeaderValue::from(received),
                );
            }
            Self::StreamClosed(_) => {
                headers.insert(
                    HeaderName::from_static(STREAM_CLOSED),
                    HeaderValue::from_static("true"),
                );
            }
            _ => {}
        }

        response
    }
}

impl From<ParleyError> for ApiError {
    fn from(err: ParleyError) -> Self {
        match err {
            ParleyError::Validation(msg) => Self::BadRequest(msg),
            e @ (ParleyError::StreamNotFound(_) | ParleyError::RunNotFound(_)) => {
                Self::NotFound(e.to_string())
            }
            ParleyError::SequenceMismatch { expected, received } => {
                Self::SequenceMismatch { expected, received }
            }
            ParleyError::StreamClosed(session) => Self::StreamClosed(session),
            e @ (ParleyError::ApprovalNotPending(_) | ParleyError::AbortedByCaller) => {
                Self::Conflict(e.to_string())
            }
            e @ ParleyError::ProducerFenced { .. } => Self::Forbidden(e.to_string()),
            ParleyError::Upstream { status, details } => {
                match StatusCode::from_u16(status) {
                    Ok(status) if status.is_client_error() || status.is_server_error() => {
                        Self::Upstream { status, details }
                    }
                    _ => Self::BadGateway(format!("log store returned {}: {}", status, details)),
                }
            }
            ParleyError::Unavailable(msg) => Self::ServiceUnavailable(msg),
            ParleyError::Transport(msg) => Self::BadGateway(msg),
            e @ (ParleyError::Generation(_) | ParleyError::Internal(_)) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Internal(msg) => Self::Internal(format!("Authentication error: {}", msg)),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
