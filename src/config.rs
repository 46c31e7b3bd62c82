//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Upstream authorities (SSO validator and backend token issuer)
    pub upstream: UpstreamConfig,
    /// Service credential used against the backend token endpoints
    pub security: SecurityConfig,
    /// Session and cookie settings
    pub session: SessionConfig,
    /// Key-value store settings
    pub store: StoreConfig,
    /// Proxy authorization policy
    pub policy: PolicyConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Take the client IP from the first `X-Forwarded-For` hop
    pub trust_proxy: bool,
    /// Allowed CORS origins (empty = mirror the request origin)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5181,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
            trust_proxy: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Upstream authorities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Backend API base URL (token issuer and proxy target)
    pub api_base: String,
    /// SSO service base URL
    pub sso_url: String,
    /// Ticket validation path on the SSO service
    pub sso_validate_path: String,
    /// Backend token path used for the SSO exchange grant
    pub erp_token_path: String,
    /// Backend token path used for the password grant
    pub erp_user_token_path: String,
    /// Timeout for every upstream call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Grant type sent for SSO exchanges
    pub sso_grant_type: String,
    /// Scope requested for SSO exchanges
    pub sso_scope: String,
    /// Grant type for direct-credential logins when the client sends none
    pub default_grant_type: String,
    /// Scope for direct-credential logins when the client sends none
    pub default_scope: String,
    /// Upper-case login and password before the password grant
    pub uppercase_credentials: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            sso_url: String::new(),
            sso_validate_path: "/api/v1/auth/sso/validate".to_string(),
            erp_token_path: "/api/v1/auth/token/erp".to_string(),
            erp_user_token_path: "/api/v1/auth/token/erp/user".to_string(),
            timeout: Duration::from_secs(15),
            sso_grant_type: "sso_exchange".to_string(),
            sso_scope: "cotacao".to_string(),
            default_grant_type: "password".to_string(),
            default_scope: "default".to_string(),
            uppercase_credentials: true,
        }
    }
}

impl UpstreamConfig {
    /// Full URL of the SSO ticket validation endpoint
    #[must_use]
    pub fn sso_validate_url(&self) -> String {
        format!("{}{}", self.sso_url, self.sso_validate_path)
    }

    /// Full URL of the SSO-exchange token endpoint
    #[must_use]
    pub fn erp_token_url(&self) -> String {
        format!("{}{}", self.api_base, self.erp_token_path)
    }

    /// Full URL of the password-grant token endpoint
    #[must_use]
    pub fn erp_user_token_url(&self) -> String {
        format!("{}{}", self.api_base, self.erp_user_token_path)
    }
}

/// Service credential for the backend token endpoints
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// OAuth client id (supports `env:VAR_NAME`)
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl SecurityConfig {
    /// Resolve `env:VAR_NAME` references in place
    fn resolve(&mut self) {
        self.client_id = resolve_env_ref(&self.client_id);
        self.client_secret = resolve_env_ref(&self.client_secret);
    }
}

/// Session and cookie settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie carrying the session handle
    pub cookie_name: String,
    /// Cookie carrying the refresh handle
    pub refresh_cookie_name: String,
    /// Cookie domain
    pub domain: Option<String>,
    /// Mark cookies `Secure`
    pub secure: bool,
    /// Session TTL when the backend does not report `expires_in`
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Refresh token TTL
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "broker_session".to_string(),
            refresh_cookie_name: "broker_refresh".to_string(),
            domain: None,
            secure: true,
            ttl: Duration::from_secs(86_400),
            refresh_ttl: Duration::from_secs(7 * 86_400),
        }
    }
}

/// Store backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local `DashMap`
    #[default]
    Memory,
    /// Redis server
    Redis,
}

/// Key-value store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend kind
    pub backend: StoreBackend,
    /// Connection URL (required for `redis`, supports `env:VAR_NAME`)
    pub url: Option<String>,
    /// Prefix for every key
    pub key_prefix: String,
    /// Reaper interval for the in-memory backend
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            key_prefix: "broker:".to_string(),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Proxy authorization policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Health check path (passthrough)
    pub health_path: String,
    /// Path prefixes that pass through unauthenticated
    pub public_prefixes: Vec<String>,
    /// SSO callback path (passthrough)
    pub sso_callback_path: String,
    /// Paths that receive the service credential on `POST`
    pub service_credential_paths: Vec<String>,
    /// Prefix prepended to proxied paths that lack it (empty disables)
    pub api_prefix: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            health_path: "/health".to_string(),
            public_prefixes: vec!["/api/v1/public/".to_string()],
            sso_callback_path: "/api/v1/auth/sso/callback".to_string(),
            service_credential_paths: vec!["/api/v1/auth/token/erp".to_string()],
            api_prefix: "/api".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (BROKER_ prefix, __ for nesting)
        figment = figment.merge(Env::prefixed("BROKER_").split("__"));

        Self::from_figment(&figment)
    }

    /// Extract, resolve and validate configuration from a prepared figment
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();
        config.security.resolve();
        config.store.url = config.store.url.as_deref().map(resolve_env_ref);
        config.upstream.api_base = sanitize_base_url(&config.upstream.api_base);
        config.upstream.sso_url = sanitize_base_url(&config.upstream.sso_url);

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the broker cannot start with
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("upstream.api_base", &self.upstream.api_base),
            ("upstream.sso_url", &self.upstream.sso_url),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{name} is required")));
            }
            Url::parse(value).map_err(|e| Error::Config(format!("{name} is invalid: {e}")))?;
        }

        if self.security.client_id.is_empty() || self.security.client_secret.is_empty() {
            return Err(Error::Config(
                "security.client_id and security.client_secret are required".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return Err(Error::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }

        if self.session.ttl.is_zero() || self.session.refresh_ttl.is_zero() {
            return Err(Error::Config(
                "session.ttl and session.refresh_ttl must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in upstream URLs and credentials
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            &mut self.upstream.api_base,
            &mut self.upstream.sso_url,
            &mut self.security.client_id,
            &mut self.security.client_secret,
        ] {
            *value = Self::expand_string(&re, value);
        }

        if let Some(url) = self.store.url.as_mut() {
            *url = Self::expand_string(&re, url);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Resolve an `env:VAR_NAME` reference, falling back to the literal value
fn resolve_env_ref(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Trim whitespace and a single trailing slash
fn sanitize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    trimmed.strip_suffix('/').unwrap_or(trimmed).to_string()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "7d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "2h", "7d" or a bare number of seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
