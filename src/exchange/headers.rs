//! Headers forwarded to the token endpoints.

use axum::http::HeaderMap;

/// Headers passed through on the SSO exchange grant
pub const SSO_FORWARDED: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "x-bff-ip",
    "x-request-id",
    "user-agent",
    "x-client-version",
];

/// Headers passed through on the password grant
pub const CREDENTIAL_FORWARDED: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "x-bff-ip",
    "x-request-id",
    "user-agent",
    "x-client-version",
    "x-client-id",
    "x-api-key",
];

/// Whitelisted request headers, lowercase names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedHeaders(Vec<(&'static str, String)>);

impl ForwardedHeaders {
    /// Copy the non-empty headers named in `whitelist` out of `headers`.
    #[must_use]
    pub fn pick(headers: &HeaderMap, whitelist: &[&'static str]) -> Self {
        let picked = whitelist
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?.to_str().ok()?;
                (!value.is_empty()).then(|| (*name, value.to_string()))
            })
            .collect();
        Self(picked)
    }

    /// Value of a forwarded header
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// All forwarded headers
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(name, value)| (*name, value.as_str()))
    }

    /// Number of headers
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was picked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        headers.insert("user-agent", HeaderValue::from_static("agent/1.0"));
        headers.insert("x-api-key", HeaderValue::from_static("k"));
        headers.insert("x-client-version", HeaderValue::from_static(""));
        headers.insert("cookie", HeaderValue::from_static("secret=1"));
        headers
    }

    #[test]
    fn sso_whitelist_drops_api_key_and_cookies() {
        let picked = ForwardedHeaders::pick(&headers(), SSO_FORWARDED);
        assert_eq!(picked.get("x-forwarded-for"), Some("1.1.1.1"));
        assert_eq!(picked.get("user-agent"), Some("agent/1.0"));
        assert_eq!(picked.get("x-api-key"), None);
        assert_eq!(picked.get("cookie"), None);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn credential_whitelist_keeps_api_key() {
        let picked = ForwardedHeaders::pick(&headers(), CREDENTIAL_FORWARDED);
        assert_eq!(picked.get("x-api-key"), Some("k"));
    }

    #[test]
    fn empty_values_are_skipped() {
        let picked = ForwardedHeaders::pick(&headers(), CREDENTIAL_FORWARDED);
        assert_eq!(picked.get("x-client-version"), None);
    }
}
