//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use super::cookies::{
    clear_refresh_cookie, clear_session_cookie, refresh_cookie, session_cookie,
};
use super::policy::{Denied, PolicyEngine, resolve_session, session_handle};
use super::proxy::Forwarder;
use super::request::{ClientIp, header_str, normalize_path, normalize_request};
use crate::config::Config;
use crate::exchange::headers::{CREDENTIAL_FORWARDED, SSO_FORWARDED};
use crate::exchange::{
    CredentialExchange, CredentialLogin, ForwardedHeaders, ServiceCredential, SsoExchange,
    SsoTicket, TicketValidator, TokenAuthority,
};
use crate::session::{
    ClientType, RotationError, SessionLifecycle, SessionPayload, SessionRepository,
    normalize_login,
};
use crate::store::{Keyspace, KvStore};
use crate::Error;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Session open / rotate / logout
    pub sessions: Arc<SessionLifecycle>,
    /// SSO ticket exchange
    pub sso: SsoExchange,
    /// Password grant exchange
    pub credentials: CredentialExchange,
    /// Proxy authorization policy
    pub policy: PolicyEngine,
    /// Reverse proxy
    pub forwarder: Forwarder,
}

impl AppState {
    /// Wire every component from configuration and the given upstreams.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn KvStore>,
        validator: Arc<dyn TicketValidator>,
        authority: Arc<dyn TokenAuthority>,
        forwarder: Forwarder,
    ) -> Self {
        let repo = Arc::new(SessionRepository::new(
            store,
            Keyspace::new(config.store.key_prefix.clone()),
            config.session.ttl,
        ));
        let sessions = Arc::new(SessionLifecycle::new(
            Arc::clone(&repo),
            config.session.refresh_ttl,
        ));
        let credential =
            ServiceCredential::new(&config.security.client_id, &config.security.client_secret);

        let sso = SsoExchange::new(
            validator,
            Arc::clone(&authority),
            Arc::clone(&sessions),
            config.upstream.sso_grant_type.clone(),
            config.upstream.sso_scope.clone(),
        );
        let credentials = CredentialExchange::new(
            authority,
            config.upstream.default_grant_type.clone(),
            config.upstream.default_scope.clone(),
            config.upstream.uppercase_credentials,
        );
        let policy = PolicyEngine::new(
            config.policy.clone(),
            repo,
            credential,
            config.session.cookie_name.clone(),
        );

        Self {
            config,
            sessions,
            sso,
            credentials,
            policy,
            forwarder,
        }
    }

    fn repo(&self) -> &SessionRepository {
        self.sessions.repository()
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let server = &state.config.server;
    let cors = cors_layer(&server.cors_origins);
    let timeout =
        TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, server.request_timeout);
    let body_limit = DefaultBodyLimit::max(server.max_body_size);

    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/sso/callback", post(sso_callback_handler))
        .route("/api/v1/auth/sso/callback", post(sso_callback_handler))
        .route("/auth/token/erp/user", post(user_login_handler))
        .route("/api/v1/auth/token/erp/user", post(user_login_handler))
        .route("/bff/session", get(session_status_handler))
        .route("/bff/refresh", post(refresh_handler))
        .route("/bff/logout", post(logout_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            normalize_request,
        ))
        .layer(body_limit)
        .layer(timeout)
        .layer(cors)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credentialed CORS. An empty origin list mirrors the request origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
}

fn client_type(headers: &HeaderMap) -> ClientType {
    ClientType::from_hint(header_str(headers, "x-client-type").or_else(|| header_str(headers, "x-client-typ")))
}

fn unauthenticated(jar: CookieJar, clear_cookie: bool, state: &AppState) -> Response {
    let jar = if clear_cookie {
        jar.add(clear_session_cookie(&state.config.session))
    } else {
        jar
    };
    (
        StatusCode::UNAUTHORIZED,
        jar,
        Json(json!({ "authenticated": false })),
    )
        .into_response()
}

/// JSON body, with rejections reported as validation errors
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| Error::Validation(e.body_text()))?;
        Ok(Self(value))
    }
}

/// JSON or form-encoded body
struct JsonOrForm<T>(T);

impl<S, T> FromRequest<S> for JsonOrForm<T>
where
    S: Send + Sync,
    T: serde::de::DeserializeOwned + Send + 'static,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let axum::Form(value) = axum::Form::<T>::from_request(req, state)
                .await
                .map_err(|e| Error::Validation(e.body_text()))?;
            Ok(Self(value))
        } else {
            let JsonBody(value) = JsonBody::<T>::from_request(req, state).await?;
            Ok(Self(value))
        }
    }
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
    }))
}

#[derive(Debug, Deserialize)]
struct SsoCallbackBody {
    #[serde(default)]
    ticket: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// POST /auth/sso/callback
async fn sso_callback_handler(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    headers: HeaderMap,
    jar: CookieJar,
    JsonBody(body): JsonBody<SsoCallbackBody>,
) -> Result<Response, Error> {
    let request = SsoTicket {
        ticket: body.ticket.unwrap_or_default(),
        client_ip,
        override_email: body.email,
        forwarded: ForwardedHeaders::pick(&headers, SSO_FORWARDED),
        client_type: Some(client_type(&headers)),
        client_id: header_str(&headers, "x-client-id").map(str::to_string),
    };

    let login = state.sso.exchange(request).await?;
    let session = &login.session;

    let mut jar = jar.add(session_cookie(
        &state.config.session,
        &session.session_id,
        session.ttl_seconds,
    ));
    if let Some(refresh_id) = &session.refresh_id {
        jar = jar.add(refresh_cookie(
            &state.config.session,
            refresh_id,
            session.refresh_ttl_seconds,
        ));
    }

    Ok((
        jar,
        Json(json!({
            "token": session.session_id,
            "refresh_token": session.refresh_id,
            "token_type": "Bearer",
            "expires_in": session.ttl_seconds,
            "email": login.email,
            "user": login.user,
        })),
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct UserLoginBody {
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    grant_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// POST /auth/token/erp/user
async fn user_login_handler(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    headers: HeaderMap,
    jar: CookieJar,
    JsonOrForm(body): JsonOrForm<UserLoginBody>,
) -> Result<Response, Error> {
    let raw_login = body
        .login
        .filter(|l| !l.trim().is_empty())
        .or(body.username)
        .unwrap_or_default();
    let client_type = client_type(&headers);

    let request = CredentialLogin {
        login: raw_login.trim().to_string(),
        password: body.password.unwrap_or_default(),
        scope: body.scope,
        grant_type: body.grant_type,
        forwarded: ForwardedHeaders::pick(&headers, CREDENTIAL_FORWARDED),
    };
    let token = state.credentials.authenticate_with_credentials(&request).await?;

    let login = normalize_login(&request.login);
    let payload = SessionPayload {
        backend_token: token.access_token,
        user: token.user.clone(),
        scope: token.scope.clone(),
        client_type: Some(client_type),
        client_id: header_str(&headers, "x-client-id").map(str::to_string),
        login: Some(login.clone()),
        ip: Some(client_ip),
        user_agent: header_str(&headers, "user-agent").map(str::to_string),
        is_pending_mfa: false,
    };

    let session = state
        .sessions
        .open_session(payload, token.expires_in)
        .await?;
    info!(login = %login, session_id = %session.session_id, "Password login");

    let mut jar = jar.add(session_cookie(
        &state.config.session,
        &session.session_id,
        session.ttl_seconds,
    ));
    if let Some(refresh_id) = &session.refresh_id {
        jar = jar.add(refresh_cookie(
            &state.config.session,
            refresh_id,
            session.refresh_ttl_seconds,
        ));
    }

    Ok((
        jar,
        Json(json!({
            "token": session.session_id,
            "refresh_token": session.refresh_id,
            "token_type": "Bearer",
            "expires_in": session.ttl_seconds,
            "scope": token.scope,
            "user": token.user,
            "clientType": client_type.as_str(),
        })),
    )
        .into_response())
}

/// GET /bff/session
async fn session_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let handle = match session_handle(&headers, &jar, &state.config.session.cookie_name) {
        Ok(Some(handle)) => handle,
        Ok(None) => return unauthenticated(jar, false, &state),
        Err(()) => return unauthenticated(jar, true, &state),
    };

    match resolve_session(state.repo(), &handle, &client_ip).await {
        Ok(session) => Json(json!({
            "authenticated": true,
            "user": session.payload.user,
            "scope": session.payload.scope,
            "clientId": session.payload.client_id,
            "clientType": session.payload.client_type,
        }))
        .into_response(),
        Err(Denied {
            error: Error::MfaPending,
            ..
        }) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "authenticated": false, "message": "MFA Pending" })),
        )
            .into_response(),
        Err(Denied {
            error: error @ Error::Store(_),
            ..
        }) => error.into_response(),
        Err(denied) => unauthenticated(jar, denied.clear_cookie, &state),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RefreshBody {
    #[serde(default)]
    refresh_token: Option<String>,
}

/// POST /bff/refresh
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    headers: HeaderMap,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let config = &state.config.session;
    let from_body = || {
        serde_json::from_slice::<RefreshBody>(&body)
            .ok()
            .and_then(|b| b.refresh_token)
    };
    let refresh_id = jar
        .get(&config.refresh_cookie_name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .or_else(from_body);

    let Some(refresh_id) = refresh_id else {
        debug!(client_ip = %client_ip, "Refresh without a refresh token");
        return Error::Rotation(RotationError::InvalidRefresh).into_response();
    };

    let user_agent = header_str(&headers, "user-agent");
    match state.sessions.rotate(&refresh_id, &client_ip, user_agent).await {
        Ok(rotated) => {
            let jar = jar
                .add(session_cookie(config, &rotated.session_id, rotated.ttl_seconds))
                .add(refresh_cookie(
                    config,
                    &rotated.refresh_id,
                    rotated.refresh_ttl_seconds,
                ));
            (
                jar,
                Json(json!({
                    "token": rotated.session_id,
                    "refresh_token": rotated.refresh_id,
                    "token_type": "Bearer",
                    "expires_in": rotated.ttl_seconds,
                    "user": rotated.user,
                })),
            )
                .into_response()
        }
        Err(error @ Error::Rotation(_)) => {
            warn!(client_ip = %client_ip, kind = error.kind(), "Refresh rejected");
            let jar = jar
                .add(clear_refresh_cookie(config))
                .add(clear_session_cookie(config));
            (jar, error).into_response()
        }
        Err(error) => error.into_response(),
    }
}

/// POST /bff/logout
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let config = &state.config.session;
    let session_id = session_handle(&headers, &jar, &config.cookie_name)
        .ok()
        .flatten()
        .map(|handle| handle.id);
    let refresh_id = jar
        .get(&config.refresh_cookie_name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());

    state
        .sessions
        .logout(session_id.as_deref(), refresh_id.as_deref())
        .await;

    let jar = jar
        .add(clear_session_cookie(config))
        .add(clear_refresh_cookie(config));
    (jar, Json(json!({ "authenticated": false }))).into_response()
}

/// Everything else: authorize, then forward to the backend
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    request: Request,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let path = normalize_path(parts.uri.path(), &state.config.policy.api_prefix);

    if let Err(denied) = state
        .policy
        .authorize(&parts.method, &path, &mut parts.headers, &client_ip)
        .await
    {
        debug!(path = %path, kind = denied.error.kind(), "Proxy request denied");
        if denied.clear_cookie {
            let jar = CookieJar::new().add(clear_session_cookie(&state.config.session));
            return (jar, denied.error).into_response();
        }
        return denied.error.into_response();
    }

    match state
        .forwarder
        .forward(parts.method, &path, parts.uri.query(), parts.headers, body)
        .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
