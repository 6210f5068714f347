//! Error taxonomy for Steward
//!
//! Every user-visible failure carries a `kind` from a fixed taxonomy, a
//! human-readable message, and optional structured details (never secrets).
//! The taxonomy maps onto HTTP status codes at the service boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Fixed error taxonomy, serialized in snake_case on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input fails schema or constraint
    BadRequest,
    /// Unknown agent, verb, or record
    NotFound,
    /// Missing credentials for a policy-guarded operation
    Unauthorized,
    /// Policy denial
    Forbidden,
    /// Interpreter below `min_confidence` and no fallback capability
    LowConfidence,
    /// LLM, dependency, or adapter exceeded its deadline
    UpstreamTimeout,
    /// LLM or dependency unreachable
    UpstreamUnavailable,
    /// Queue or concurrency bound hit
    ResourceExhausted,
    /// Duplicate registration or write conflict
    Conflict,
    /// Unclassified bug
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::LowConfidence => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire name (snake_case), e.g. `low_confidence`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::LowConfidence => "low_confidence",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified Steward error
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    details: Option<serde_json::Value>,
}

impl Error {
    /// Build an error with an explicit kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details (never secrets)
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Input fails schema or constraint
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Unknown agent, verb, or record
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Policy denial
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Interpreter below threshold without a fallback
    pub fn low_confidence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LowConfidence, message)
    }

    /// Deadline exceeded against an upstream
    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTimeout, message)
    }

    /// Upstream unreachable
    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    /// Queue or concurrency bound hit
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    /// Duplicate registration or write conflict
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Unclassified bug
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The taxonomy kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured details, if any
    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::internal(format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::upstream_timeout(format!("request timed out: {err}"))
        } else if err.is_connect() {
            Self::upstream_unavailable(format!("connection failed: {err}"))
        } else {
            Self::internal(format!("http error: {err}"))
        }
    }
}

/// Wire envelope: `{"error": {"kind", "message", "details?"}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error payload
    pub error: ErrorBody,
}

/// Inner error payload of the wire envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Taxonomy kind (snake_case)
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for ErrorEnvelope {
    fn from(err: &Error) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind(),
                message: err.message().to_string(),
                details: err.details().cloned(),
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind().status_code();
        let envelope = ErrorEnvelope::from(&self);
        (status, Json(envelope)).into_response()
    }
}
