//! Request normalization.
//!
//! Every request gets a client IP resolved once, a request id, and the
//! forwarded-for family of headers rewritten to what the broker observed.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::{
    extract::{ConnectInfo, Request, State, connect_info::Connected},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::Response,
    serve::IncomingStream,
};
use regex::Regex;
use tokio::net::TcpListener;
use uuid::Uuid;

use super::router::AppState;

/// User agent assumed when a client sends none
pub const DEFAULT_USER_AGENT: &str = "Unknown-Client/1.0";

/// Client IP as resolved for this request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Both ends of an accepted connection.
///
/// `local` is the address the client actually reached, which differs from
/// the listener address when bound to a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAddrs {
    /// Remote peer
    pub peer: SocketAddr,
    /// Local end of this connection
    pub local: Option<SocketAddr>,
}

impl Connected<IncomingStream<'_, TcpListener>> for ConnectionAddrs {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self {
            peer: *stream.remote_addr(),
            local: stream.io().local_addr().ok(),
        }
    }
}

fn uuid_regex() -> &'static Regex {
    static UUID: OnceLock<Regex> = OnceLock::new();
    UUID.get_or_init(|| {
        Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Whether `value` is a canonical hyphenated UUID
#[must_use]
pub fn is_uuid(value: &str) -> bool {
    uuid_regex().is_match(value)
}

/// Raw `Authorization: Bearer <value>` value
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, value) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// Bearer value, only when it is a session handle
#[must_use]
pub fn bearer_session_id(headers: &HeaderMap) -> Option<&str> {
    bearer_token(headers).filter(|value| is_uuid(value))
}

/// Header value as `&str`
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the client IP.
///
/// Behind a trusted proxy the first `X-Forwarded-For` hop wins, then
/// `X-Real-IP`. Otherwise the socket peer address is used.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded.or_else(|| header_str(headers, "x-real-ip")) {
            return ip.to_string();
        }
    }

    peer.map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}

/// Prefix a proxied path with `api_prefix` unless it already carries it.
#[must_use]
pub fn normalize_path(path: &str, api_prefix: &str) -> String {
    if api_prefix.is_empty() || path.starts_with(api_prefix) {
        return path.to_string();
    }

    if path.starts_with('/') {
        format!("{api_prefix}{path}")
    } else {
        format!("{api_prefix}/{path}")
    }
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Rewrite the audit headers for a request seen from `client_ip`.
pub fn stamp_headers(headers: &mut HeaderMap, client_ip: &str, bff_ip: &str) {
    if header_str(headers, "x-request-id").is_none() {
        set(headers, "x-request-id", &Uuid::new_v4().to_string());
    }
    set(headers, "x-bff", "true");
    set(headers, "x-forwarded-for", client_ip);
    set(headers, "x-real-ip", client_ip);
    set(headers, "x-client-ip", client_ip);
    set(headers, "x-bff-ip", bff_ip);

    if header_str(headers, "user-agent").is_none() {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }

    if header_str(headers, "x-client-version").is_none() {
        if let Some(agent) = headers.get(header::USER_AGENT).cloned() {
            headers.insert("x-client-version", agent);
        }
    }
}

/// Middleware: resolve the client IP into a [`ClientIp`] extension and
/// stamp the audit headers.
pub async fn normalize_request(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let addrs = request
        .extensions()
        .get::<ConnectInfo<ConnectionAddrs>>()
        .map(|ConnectInfo(addrs)| *addrs);
    let ip = client_ip(
        request.headers(),
        addrs.map(|a| a.peer),
        state.config.server.trust_proxy,
    );
    let bff_ip = addrs
        .and_then(|a| a.local)
        .map_or_else(|| ip.clone(), |local| local.ip().to_canonical().to_string());

    stamp_headers(request.headers_mut(), &ip, &bff_ip);
    request.extensions_mut().insert(ClientIp(ip));

    next.run(request).await
}
