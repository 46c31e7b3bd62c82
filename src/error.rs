//! Error types for the credential broker

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::session::RotationError;
use crate::store::StoreError;

/// Result type alias for the credential broker
pub type Result<T> = std::result::Result<T, Error>;

/// Credential broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed client input (400)
    #[error("{0}")]
    Validation(String),

    /// An upstream authority refused the exchange. The message is the fixed,
    /// user-facing text; upstream detail is only logged.
    #[error("{0}")]
    UpstreamRejected(&'static str),

    /// No, invalid or expired session or refresh token
    #[error("{0}")]
    Unauthenticated(&'static str),

    /// Session or refresh token bound to a different network origin
    #[error("Session is not valid for this IP")]
    IpMismatch,

    /// Session exists but is still waiting for a second factor
    #[error("MFA Pending")]
    MfaPending,

    /// Refresh token rotation failed
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// Key-value backend unreachable or closed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the error is surfaced with
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamRejected(_)
            | Self::Unauthenticated(_)
            | Self::IpMismatch
            | Self::Rotation(_) => StatusCode::UNAUTHORIZED,
            Self::MfaPending => StatusCode::FORBIDDEN,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::IpMismatch => "ip_mismatch",
            Self::MfaPending => "mfa_pending",
            Self::Rotation(e) => e.kind(),
            Self::Store(_) => "store_unavailable",
            Self::Http(_) => "bad_gateway",
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal detail stays in the logs
        let message = if status.is_server_error() {
            match &self {
                Self::Store(_) => "Session store unavailable".to_string(),
                Self::Http(_) => "Upstream unavailable".to_string(),
                _ => "Internal error".to_string(),
            }
        } else {
            self.to_string()
        };

        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        }

        (
            status,
            Json(json!({
                "error": self.kind(),
                "message": message,
            })),
        )
            .into_response()
    }
}
