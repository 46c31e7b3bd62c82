//! Credential exchange.
//!
//! Turns an external proof of identity (an SSO ticket, or a login and
//! password) into a backend bearer token. Two remote services are involved:
//!
//! - a [`TicketValidator`] that checks SSO tickets and names the user
//! - a [`TokenAuthority`] (the backend) that issues bearer tokens
//!
//! The coordinators in [`sso`] and [`credentials`] are stateless. Upstream
//! failure detail is logged and replaced with a fixed message before it
//! reaches a client.

pub mod credentials;
pub mod headers;
pub mod sso;
pub mod upstream;

use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use credentials::{CredentialExchange, CredentialLogin};
pub use headers::ForwardedHeaders;
pub use sso::{SsoExchange, SsoLogin, SsoTicket};
pub use upstream::{HttpTicketValidator, HttpTokenAuthority};

/// Failure talking to an upstream service
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Network error or timeout
    #[error("Upstream unreachable: {0}")]
    Transport(String),

    /// Non-2xx response
    #[error("Upstream rejected request: HTTP {status} - {body}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Response body, for logs only
        body: String,
    },

    /// 2xx response that could not be used
    #[error("Malformed upstream response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Body of a successful ticket validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TicketValidation {
    /// User the ticket belongs to
    #[serde(default)]
    pub user: Option<Value>,
}

impl TicketValidation {
    /// `user.email`, when the validator returned one
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|user| user.get("email"))
            .and_then(Value::as_str)
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct IssuedToken {
    /// Bearer token for the backend
    pub access_token: String,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// User object
    #[serde(default)]
    pub user: Option<Value>,
}

/// Which token endpoint a grant goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEndpoint {
    /// Service token endpoint (SSO exchange grant)
    Service,
    /// User token endpoint (password grant)
    User,
}

/// Form-encoded grant sent to a token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Target endpoint
    pub endpoint: TokenEndpoint,
    /// Form fields, in order
    pub params: Vec<(String, String)>,
}

impl TokenGrant {
    /// Value of a form field
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Checks SSO tickets
#[async_trait]
pub trait TicketValidator: Send + Sync + 'static {
    /// Validate `ticket` presented from `client_ip`.
    async fn validate_ticket(
        &self,
        ticket: &str,
        client_ip: &str,
    ) -> std::result::Result<TicketValidation, UpstreamError>;
}

/// Issues backend bearer tokens
#[async_trait]
pub trait TokenAuthority: Send + Sync + 'static {
    /// Post `grant` with the whitelisted `headers`.
    async fn issue_token(
        &self,
        grant: &TokenGrant,
        headers: &ForwardedHeaders,
    ) -> std::result::Result<IssuedToken, UpstreamError>;
}

/// Service client credential, pre-encoded for HTTP Basic auth
#[derive(Clone)]
pub struct ServiceCredential {
    encoded: String,
}

impl ServiceCredential {
    /// Encode `client_id:client_secret`
    #[must_use]
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            encoded: STANDARD.encode(format!("{client_id}:{client_secret}")),
        }
    }

    /// `Basic <base64>` header value
    #[must_use]
    pub fn basic_header(&self) -> String {
        format!("Basic {}", self.encoded)
    }
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("encoded", &"[REDACTED]")
            .finish()
    }
}
