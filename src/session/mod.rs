//! Server-side sessions.
//!
//! A session stands in for a backend bearer token: the client only ever holds
//! the opaque `session_id` (and a refresh handle), while the real token stays
//! in the store.
//!
//! - [`SessionRepository`]: session records plus the login index
//! - [`RefreshTokenManager`]: refresh records plus the session → refresh index
//! - [`SessionLifecycle`]: the multi-key sequences built on both (open with
//!   login eviction, rotate-on-use refresh, best-effort logout)

pub mod lifecycle;
pub mod refresh;
pub mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use lifecycle::{OpenedSession, RotatedSession, SessionLifecycle};
pub use refresh::{IssuedRefresh, RefreshMeta, RefreshRecord, RefreshTokenManager};
pub use repository::SessionRepository;

/// Kind of client that opened the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Browser client
    #[default]
    Web,
    /// Native or mobile app
    Mobile,
}

impl ClientType {
    const MOBILE_HINTS: [&str; 6] = ["mobile", "app", "native", "expo-mobile", "ios", "android"];

    /// Classify an `X-Client-Type` header value. Anything that is not a
    /// known mobile hint is `Web`.
    #[must_use]
    pub fn from_hint(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Web;
        };
        let normalized = raw.trim().to_ascii_lowercase();
        if Self::MOBILE_HINTS.contains(&normalized.as_str()) {
            Self::Mobile
        } else {
            Self::Web
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
        }
    }
}

/// Contextual data a coordinator stores in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// Real bearer token issued by the backend. Never sent to clients.
    pub backend_token: String,
    /// User object as returned by the backend (or the SSO validator)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Granted scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<ClientType>,
    /// `X-Client-Id` presented at login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Normalized (trimmed, lowercase) login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// Client IP the session is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// User agent at login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Waiting for a second factor; not fully authenticated
    #[serde(default)]
    pub is_pending_mfa: bool,
}

/// A stored session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Client-facing handle (v4 UUID)
    pub session_id: String,
    /// Stored payload
    #[serde(flatten)]
    pub payload: SessionPayload,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// `created_at + ttl_seconds`
    pub expires_at: DateTime<Utc>,
    /// TTL the session was written with
    pub ttl_seconds: u64,
}

impl Session {
    /// Whether the session is past its absolute expiry at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of writing a new session
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSession {
    /// New handle
    pub session_id: String,
    /// TTL applied
    pub ttl_seconds: u64,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}

/// Why a refresh token could not be rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RotationError {
    /// Unknown, consumed or expired refresh handle
    #[error("Refresh token is invalid")]
    InvalidRefresh,
    /// The refresh handle outlived its session
    #[error("Session expired")]
    SessionExpired,
    /// Refresh presented from a different IP than it was issued to
    #[error("Refresh token is not valid for this IP")]
    IpMismatch,
}

impl RotationError {
    /// Machine-readable kind
    #[must_use]
    pub fn kind(self) -> &'static str {
        match self {
            Self::InvalidRefresh => "invalid_refresh",
            Self::SessionExpired => "session_expired",
            Self::IpMismatch => "ip_mismatch",
        }
    }
}

/// Trim and lowercase a login for indexing
#[must_use]
pub fn normalize_login(login: &str) -> String {
    login.trim().to_lowercase()
}
