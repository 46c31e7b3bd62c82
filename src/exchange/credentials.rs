//! Direct-credential (password grant) exchange.

use std::sync::Arc;

use tracing::warn;

use super::{ForwardedHeaders, IssuedToken, TokenAuthority, TokenEndpoint, TokenGrant};
use crate::{Error, Result};

const CREDENTIALS_REJECTED: &str = "Invalid credentials or access denied by backend system";

/// A login/password pair presented to the broker
#[derive(Clone, Default)]
pub struct CredentialLogin {
    /// Login (as typed)
    pub login: String,
    /// Password
    pub password: String,
    /// Requested scope
    pub scope: Option<String>,
    /// Requested grant type
    pub grant_type: Option<String>,
    /// Whitelisted request headers
    pub forwarded: ForwardedHeaders,
}

impl std::fmt::Debug for CredentialLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLogin")
            .field("login", &self.login)
            .field("password", &"[REDACTED]")
            .field("scope", &self.scope)
            .field("grant_type", &self.grant_type)
            .finish_non_exhaustive()
    }
}

/// Runs the password grant against the user token endpoint.
pub struct CredentialExchange {
    authority: Arc<dyn TokenAuthority>,
    default_grant_type: String,
    default_scope: String,
    uppercase: bool,
}

impl CredentialExchange {
    /// Create a coordinator
    #[must_use]
    pub fn new(
        authority: Arc<dyn TokenAuthority>,
        default_grant_type: impl Into<String>,
        default_scope: impl Into<String>,
        uppercase: bool,
    ) -> Self {
        Self {
            authority,
            default_grant_type: default_grant_type.into(),
            default_scope: default_scope.into(),
            uppercase,
        }
    }

    fn grant(&self, request: &CredentialLogin, login: &str) -> TokenGrant {
        let (login, password) = if self.uppercase {
            (login.to_uppercase(), request.password.to_uppercase())
        } else {
            (login.to_string(), request.password.clone())
        };

        let grant_type = request
            .grant_type
            .clone()
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| self.default_grant_type.clone());
        let scope = request
            .scope
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.default_scope.clone());

        TokenGrant {
            endpoint: TokenEndpoint::User,
            params: vec![
                ("grant_type".to_string(), grant_type),
                ("scope".to_string(), scope),
                ("login".to_string(), login.clone()),
                ("username".to_string(), login),
                ("password".to_string(), password),
            ],
        }
    }

    /// Trade a login and password for a backend token.
    ///
    /// A missing login or password never reaches the backend.
    pub async fn authenticate_with_credentials(&self, request: &CredentialLogin) -> Result<IssuedToken> {
        let login = request.login.trim();
        if login.is_empty() || request.password.is_empty() {
            return Err(Error::Validation(
                "login and password are required".to_string(),
            ));
        }

        let grant = self.grant(request, login);
        self.authority
            .issue_token(&grant, &request.forwarded)
            .await
            .map_err(|e| {
                warn!(login = %login.to_lowercase(), error = %e, "Backend refused password grant");
                Error::UpstreamRejected(CREDENTIALS_REJECTED)
            })
    }
}
