//! HTTP implementations of the upstream traits.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use super::{
    ForwardedHeaders, IssuedToken, ServiceCredential, TicketValidation, TicketValidator,
    TokenAuthority, TokenEndpoint, TokenGrant, UpstreamError,
};
use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Build the shared HTTP client for upstream calls.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create upstream HTTP client: {e}")))
}

async fn rejected(response: reqwest::Response) -> UpstreamError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    UpstreamError::Rejected { status, body }
}

/// Validates tickets with `POST {sso_url}/api/v1/auth/sso/validate`
pub struct HttpTicketValidator {
    client: Client,
    url: String,
}

impl HttpTicketValidator {
    /// Create a validator posting to `url`
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TicketValidator for HttpTicketValidator {
    async fn validate_ticket(
        &self,
        ticket: &str,
        client_ip: &str,
    ) -> std::result::Result<TicketValidation, UpstreamError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "ticket": ticket, "client_ip": client_ip }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        debug!(url = %self.url, "SSO ticket validated");
        Ok(response.json().await?)
    }
}

/// Issues tokens from the backend token endpoints with HTTP Basic service auth
pub struct HttpTokenAuthority {
    client: Client,
    service_url: String,
    user_url: String,
    credential: ServiceCredential,
}

impl HttpTokenAuthority {
    /// Create an authority for the endpoints in `config`
    #[must_use]
    pub fn new(client: Client, config: &UpstreamConfig, credential: ServiceCredential) -> Self {
        Self {
            client,
            service_url: config.erp_token_url(),
            user_url: config.erp_user_token_url(),
            credential,
        }
    }

    fn url(&self, endpoint: TokenEndpoint) -> &str {
        match endpoint {
            TokenEndpoint::Service => &self.service_url,
            TokenEndpoint::User => &self.user_url,
        }
    }
}

#[async_trait]
impl TokenAuthority for HttpTokenAuthority {
    async fn issue_token(
        &self,
        grant: &TokenGrant,
        headers: &ForwardedHeaders,
    ) -> std::result::Result<IssuedToken, UpstreamError> {
        let url = self.url(grant.endpoint);
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::AUTHORIZATION, self.credential.basic_header())
            .form(&grant.params);

        for (name, value) in headers.iter() {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let token: IssuedToken = response.json().await?;
        if token.access_token.is_empty() {
            return Err(UpstreamError::Malformed(
                "token response has an empty access_token".to_string(),
            ));
        }

        debug!(url = %url, "Backend token issued");
        Ok(token)
    }
}
