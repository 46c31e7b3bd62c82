//! Reverse proxy to the backend.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Method, header},
    response::Response,
};
use reqwest::Client;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Build the proxy client. Bodies pass through byte for byte, so the
/// client must not decompress them.
pub fn build_proxy_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .no_gzip()
        .no_deflate()
        .no_brotli()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create proxy HTTP client: {e}")))
}

/// Streams requests to the backend base URL and the responses back
pub struct Forwarder {
    client: Client,
    base: String,
}

impl Forwarder {
    /// Create a forwarder for `base` (no trailing slash)
    #[must_use]
    pub fn new(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    /// Target URL for a normalized path and optional query
    #[must_use]
    pub fn target(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(query) if !query.is_empty() => format!("{}{path}?{query}", self.base),
            _ => format!("{}{path}", self.base),
        }
    }

    /// Forward a request and stream the backend response back.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        mut headers: HeaderMap,
        body: Body,
    ) -> Result<Response> {
        let url = self.target(path, query);
        strip_hop_by_hop(&mut headers);

        let upstream = self
            .client
            .request(method.clone(), &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let status = upstream.status();
        if status.is_client_error() || status.is_server_error() {
            warn!(method = %method, path = %path, status = status.as_u16(), "Backend returned error status");
        } else {
            debug!(method = %method, path = %path, status = status.as_u16(), "Proxied request");
        }

        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        response_headers.remove(header::CONTENT_LENGTH);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn target_keeps_query() {
        let client = build_proxy_client(Duration::from_secs(1)).unwrap();
        let forwarder = Forwarder::new(client, "http://api.local");

        assert_eq!(
            forwarder.target("/api/v1/items", Some("page=2")),
            "http://api.local/api/v1/items?page=2"
        );
        assert_eq!(forwarder.target("/api/v1/items", None), "http://api.local/api/v1/items");
        assert_eq!(forwarder.target("/api/v1/items", Some("")), "http://api.local/api/v1/items");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("broker.local"));
        headers.insert("authorization", HeaderValue::from_static("Bearer tok1"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("host").is_none());
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok1");
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let client = build_proxy_client(Duration::from_millis(500)).unwrap();
        let forwarder = Forwarder::new(client, "http://127.0.0.1:9");

        let err = forwarder
            .forward(Method::GET, "/api/v1/items", None, HeaderMap::new(), Body::empty())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
