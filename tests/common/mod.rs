//! Shared fixtures: fake upstreams, a throwaway backend and request helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, Response, StatusCode},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use credential_broker::config::Config;
use credential_broker::exchange::{
    ForwardedHeaders, IssuedToken, TicketValidation, TicketValidator, TokenAuthority, TokenGrant,
    UpstreamError,
};
use credential_broker::gateway::proxy::build_proxy_client;
use credential_broker::gateway::{AppState, Forwarder, create_router};
use credential_broker::store::{InMemoryStore, KvStore};

/// Accepts `T1` for `a@x.com` and `T2` for `b@x.com`
pub struct FakeValidator;

#[async_trait]
impl TicketValidator for FakeValidator {
    async fn validate_ticket(
        &self,
        ticket: &str,
        _client_ip: &str,
    ) -> Result<TicketValidation, UpstreamError> {
        let email = match ticket {
            "T1" => "a@x.com",
            "T2" => "b@x.com",
            _ => {
                return Err(UpstreamError::Rejected {
                    status: 401,
                    body: "ticket expired".to_string(),
                });
            }
        };
        Ok(TicketValidation {
            user: Some(json!({ "email": email })),
        })
    }
}

/// Issues `tok1`, `tok2`, ... and records every grant
#[derive(Default)]
pub struct FakeAuthority {
    issued: AtomicUsize,
    pub grants: Mutex<Vec<TokenGrant>>,
    pub expires_in: Option<u64>,
}

impl FakeAuthority {
    pub fn with_expiry(expires_in: u64) -> Self {
        Self {
            expires_in: Some(expires_in),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TokenAuthority for FakeAuthority {
    async fn issue_token(
        &self,
        grant: &TokenGrant,
        _headers: &ForwardedHeaders,
    ) -> Result<IssuedToken, UpstreamError> {
        self.grants.lock().push(grant.clone());

        if grant
            .param("password")
            .is_some_and(|p| p.eq_ignore_ascii_case("wrong"))
        {
            return Err(UpstreamError::Rejected {
                status: 401,
                body: "bad password for alice".to_string(),
            });
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let email = grant
            .param("email")
            .or_else(|| grant.param("login"))
            .unwrap_or("unknown");
        Ok(IssuedToken {
            access_token: format!("tok{n}"),
            token_type: Some("Bearer".to_string()),
            scope: grant.param("scope").map(str::to_string),
            expires_in: self.expires_in.or(Some(3600)),
            user: Some(json!({ "email": email })),
        })
    }
}

/// A broker wired to fakes, an in-memory store and `backend`
pub struct Harness {
    pub router: Router,
    pub store: Arc<InMemoryStore>,
    pub authority: Arc<FakeAuthority>,
}

impl Harness {
    pub fn new(backend: &str) -> Self {
        Self::with(Config::default(), FakeAuthority::default(), backend)
    }

    pub fn with(config: Config, authority: FakeAuthority, backend: &str) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let authority = Arc::new(authority);
        let client = build_proxy_client(Duration::from_secs(5)).unwrap();

        let state = AppState::new(
            config,
            Arc::clone(&store) as Arc<dyn KvStore>,
            Arc::new(FakeValidator),
            Arc::clone(&authority) as Arc<dyn TokenAuthority>,
            Forwarder::new(client, backend),
        );

        Self {
            router: create_router(Arc::new(state)),
            store,
            authority,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        read(response).await
    }
}

pub async fn read(response: Response<Body>) -> (StatusCode, HeaderMap, Value) {
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    (status, headers, body)
}

pub fn post_json(uri: &str, ip: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_with_bearer(uri: &str, ip: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

/// Exchange `ticket` from `ip`, returning `(token, refresh_token)`
pub async fn sso_login(harness: &Harness, ticket: &str, ip: &str) -> (String, String) {
    let (status, _, body) = harness
        .send(post_json(
            "/auth/sso/callback",
            ip,
            &json!({ "ticket": ticket }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    (
        body["token"].as_str().unwrap().to_string(),
        body["refresh_token"].as_str().unwrap().to_string(),
    )
}

/// All `Set-Cookie` values on a response
pub fn set_cookies(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Backend that echoes what it received as JSON
pub async fn spawn_echo_backend() -> String {
    let app = Router::new().fallback(|request: Request<Body>| async move {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Json(json!({
            "method": request.method().as_str(),
            "path": request.uri().path(),
            "query": request.uri().query(),
            "authorization": header("authorization"),
            "x_forwarded_for": header("x-forwarded-for"),
            "x_bff": header("x-bff"),
            "x_bff_ip": header("x-bff-ip"),
        }))
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
