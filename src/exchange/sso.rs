//! SSO ticket exchange.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use super::{ForwardedHeaders, TicketValidator, TokenAuthority, TokenEndpoint, TokenGrant};
use crate::session::{ClientType, OpenedSession, SessionLifecycle, SessionPayload, normalize_login};
use crate::{Error, Result};

const TICKET_REJECTED: &str = "SSO ticket invalid or expired";
const BACKEND_REJECTED: &str = "Access denied by backend system";

/// An SSO ticket presented at the callback
#[derive(Debug, Clone, Default)]
pub struct SsoTicket {
    /// Opaque single-use ticket
    pub ticket: String,
    /// Requesting client IP
    pub client_ip: String,
    /// Email to use instead of the one the validator returns
    pub override_email: Option<String>,
    /// Whitelisted request headers
    pub forwarded: ForwardedHeaders,
    /// Client kind
    pub client_type: Option<ClientType>,
    /// `X-Client-Id`
    pub client_id: Option<String>,
}

/// Outcome of a successful exchange
#[derive(Debug, Clone)]
pub struct SsoLogin {
    /// The session opened for the user
    pub session: OpenedSession,
    /// Normalized email the session is indexed under
    pub email: String,
    /// Backend user, falling back to the SSO user
    pub user: Option<Value>,
}

/// Validates an SSO ticket, trades it for a backend token and opens a session
pub struct SsoExchange {
    validator: Arc<dyn TicketValidator>,
    authority: Arc<dyn TokenAuthority>,
    sessions: Arc<SessionLifecycle>,
    grant_type: String,
    scope: String,
}

impl SsoExchange {
    /// Create a coordinator that requests `grant_type` / `scope` from the backend.
    #[must_use]
    pub fn new(
        validator: Arc<dyn TicketValidator>,
        authority: Arc<dyn TokenAuthority>,
        sessions: Arc<SessionLifecycle>,
        grant_type: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            validator,
            authority,
            sessions,
            grant_type: grant_type.into(),
            scope: scope.into(),
        }
    }

    /// Run the full exchange for `request`.
    pub async fn exchange(&self, request: SsoTicket) -> Result<SsoLogin> {
        let ticket = request.ticket.trim();
        if ticket.is_empty() {
            return Err(Error::Validation("ticket is required".to_string()));
        }

        let validation = self
            .validator
            .validate_ticket(ticket, &request.client_ip)
            .await
            .map_err(|e| {
                warn!(client_ip = %request.client_ip, error = %e, "SSO validator rejected ticket");
                Error::UpstreamRejected(TICKET_REJECTED)
            })?;

        let chosen = request
            .override_email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .or_else(|| validation.email().map(str::trim))
            .filter(|email| !email.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                warn!(client_ip = %request.client_ip, "SSO validation returned no email");
                Error::UpstreamRejected(TICKET_REJECTED)
            })?;
        // The backend sees the email as chosen; the index uses the normalized form
        let email = normalize_login(&chosen);

        let grant = TokenGrant {
            endpoint: TokenEndpoint::Service,
            params: vec![
                ("grant_type".to_string(), self.grant_type.clone()),
                ("scope".to_string(), self.scope.clone()),
                ("email".to_string(), chosen),
            ],
        };

        let token = self
            .authority
            .issue_token(&grant, &request.forwarded)
            .await
            .map_err(|e| {
                warn!(login = %email, error = %e, "Backend refused SSO exchange");
                Error::UpstreamRejected(BACKEND_REJECTED)
            })?;

        let user = token.user.or(validation.user);
        let payload = SessionPayload {
            backend_token: token.access_token,
            user: user.clone(),
            scope: token.scope,
            client_type: request.client_type,
            client_id: request.client_id,
            login: Some(email.clone()),
            ip: Some(request.client_ip),
            user_agent: request.forwarded.get("user-agent").map(str::to_string),
            is_pending_mfa: false,
        };

        let session = self.sessions.open_session(payload, token.expires_in).await?;
        info!(login = %email, session_id = %session.session_id, "SSO login");

        Ok(SsoLogin {
            session,
            email,
            user,
        })
    }
}
