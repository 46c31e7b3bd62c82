//! Authorization policy for proxied requests.
//!
//! Every request bound for the backend is classified into exactly one
//! [`Policy`] and mutated accordingly before it leaves the broker.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, warn};

use super::request::{bearer_session_id, is_uuid};
use crate::config::PolicyConfig;
use crate::exchange::ServiceCredential;
use crate::session::{Session, SessionRepository};
use crate::{Error, Result};

/// How a proxied request is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Forwarded untouched
    Passthrough,
    /// Service client credential added as HTTP Basic auth
    InjectServiceCredential,
    /// A live session is required; its backend token replaces the handle
    RequireSession,
}

impl Policy {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::InjectServiceCredential => "inject_service_credential",
            Self::RequireSession => "require_session",
        }
    }
}

/// Where a session handle was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleSource {
    /// `Authorization: Bearer <uuid>`
    Bearer,
    /// Session cookie
    Cookie,
}

/// Session handle presented by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// The handle
    pub id: String,
    /// Where it came from
    pub source: HandleSource,
}

/// A refused request. `clear_cookie` is set when the response should also
/// expire the session cookie.
#[derive(Debug)]
pub struct Denied {
    /// Error to render
    pub error: Error,
    /// Expire the session cookie in the response
    pub clear_cookie: bool,
}

impl Denied {
    fn new(error: Error, clear_cookie: bool) -> Self {
        telemetry_metrics::counter!("broker_policy_rejections_total", "kind" => error.kind())
            .increment(1);
        Self {
            error,
            clear_cookie,
        }
    }
}

impl From<Error> for Denied {
    fn from(error: Error) -> Self {
        Self::new(error, false)
    }
}

/// Find the session handle on a request: a canonical UUID bearer first,
/// then the session cookie. A cookie that is not a UUID is reported as
/// `Err(())` so the caller can expire it.
pub fn session_handle(
    headers: &HeaderMap,
    cookies: &CookieJar,
    cookie_name: &str,
) -> std::result::Result<Option<SessionHandle>, ()> {
    if let Some(id) = bearer_session_id(headers) {
        return Ok(Some(SessionHandle {
            id: id.to_string(),
            source: HandleSource::Bearer,
        }));
    }

    match cookies.get(cookie_name).map(|c| c.value().trim().to_string()) {
        Some(value) if is_uuid(&value) => Ok(Some(SessionHandle {
            id: value,
            source: HandleSource::Cookie,
        })),
        Some(value) if !value.is_empty() => Err(()),
        _ => Ok(None),
    }
}

/// Resolve and check the session for a request.
///
/// Pending-MFA sessions are refused with `403`, sessions bound to another IP
/// with `401`.
pub async fn resolve_session(
    repo: &SessionRepository,
    handle: &SessionHandle,
    client_ip: &str,
) -> std::result::Result<Session, Denied> {
    let from_cookie = handle.source == HandleSource::Cookie;

    let Some(session) = repo.get_session(&handle.id).await? else {
        return Err(Denied::new(
            Error::Unauthenticated("Session invalid or expired"),
            from_cookie,
        ));
    };

    if session.payload.ip.as_deref().is_some_and(|ip| ip != client_ip) {
        warn!(
            session_id = %handle.id,
            client_ip = %client_ip,
            "Session presented from a different IP"
        );
        return Err(Denied::new(Error::IpMismatch, from_cookie));
    }

    if session.payload.is_pending_mfa {
        return Err(Denied::new(Error::MfaPending, false));
    }

    Ok(session)
}

/// Classifies proxied requests and applies the matching policy
pub struct PolicyEngine {
    config: PolicyConfig,
    repo: Arc<SessionRepository>,
    credential: ServiceCredential,
    cookie_name: String,
}

impl PolicyEngine {
    /// Create an engine
    #[must_use]
    pub fn new(
        config: PolicyConfig,
        repo: Arc<SessionRepository>,
        credential: ServiceCredential,
        cookie_name: impl Into<String>,
    ) -> Self {
        Self {
            config,
            repo,
            credential,
            cookie_name: cookie_name.into(),
        }
    }

    fn is_health(&self, path: &str) -> bool {
        path == self.config.health_path
            || path
                .strip_prefix(self.config.api_prefix.as_str())
                .is_some_and(|rest| !self.config.api_prefix.is_empty() && rest == self.config.health_path)
    }

    /// Classify a (normalized) path and method.
    #[must_use]
    pub fn classify(&self, path: &str, method: &Method) -> Policy {
        if self.is_health(path)
            || path == self.config.sso_callback_path
            || self
                .config
                .public_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Policy::Passthrough;
        }

        if method == Method::POST
            && self
                .config
                .service_credential_paths
                .iter()
                .any(|p| p == path)
        {
            return Policy::InjectServiceCredential;
        }

        Policy::RequireSession
    }

    /// Apply the policy for `path` to `headers`.
    pub async fn authorize(
        &self,
        method: &Method,
        path: &str,
        headers: &mut HeaderMap,
        client_ip: &str,
    ) -> std::result::Result<Policy, Denied> {
        let policy = self.classify(path, method);
        debug!(path = %path, policy = policy.as_str(), "Classified request");

        match policy {
            Policy::Passthrough => {}
            Policy::InjectServiceCredential => {
                if !headers.contains_key(header::AUTHORIZATION) {
                    headers.insert(header::AUTHORIZATION, header_value(&self.credential.basic_header())?);
                }
            }
            Policy::RequireSession => {
                let cookies = CookieJar::from_headers(headers);
                let handle = match session_handle(headers, &cookies, &self.cookie_name) {
                    Ok(Some(handle)) => handle,
                    Ok(None) => {
                        return Err(Denied::new(
                            Error::Unauthenticated("Bearer session required"),
                            false,
                        ));
                    }
                    Err(()) => {
                        return Err(Denied::new(
                            Error::Unauthenticated("Session invalid or expired"),
                            true,
                        ));
                    }
                };

                let session = resolve_session(&self.repo, &handle, client_ip).await?;
                headers.insert(
                    header::AUTHORIZATION,
                    header_value(&format!("Bearer {}", session.payload.backend_token))?,
                );
            }
        }

        Ok(policy)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Internal(format!("Invalid authorization header value: {e}")))
}
