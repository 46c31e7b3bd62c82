//! Session and refresh cookies.

use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::config::SessionConfig;

fn build(config: &SessionConfig, name: &str, value: &str, max_age: Duration) -> Cookie<'static> {
    let mut builder = Cookie::build((name.to_string(), value.to_string()))
        .http_only(true)
        .secure(config.secure)
        .same_site(SameSite::Lax)
        .path("/".to_string())
        .max_age(max_age);

    if let Some(domain) = &config.domain {
        builder = builder.domain(domain.clone());
    }

    builder.build()
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Session handle cookie, living as long as the session
pub fn session_cookie(config: &SessionConfig, session_id: &str, ttl_seconds: u64) -> Cookie<'static> {
    build(config, &config.cookie_name, session_id, seconds(ttl_seconds))
}

/// Refresh handle cookie
pub fn refresh_cookie(config: &SessionConfig, refresh_id: &str, ttl_seconds: u64) -> Cookie<'static> {
    build(config, &config.refresh_cookie_name, refresh_id, seconds(ttl_seconds))
}

/// Removal cookie for the session handle
pub fn clear_session_cookie(config: &SessionConfig) -> Cookie<'static> {
    build(config, &config.cookie_name, "", Duration::ZERO)
}

/// Removal cookie for the refresh handle
pub fn clear_refresh_cookie(config: &SessionConfig) -> Cookie<'static> {
    build(config, &config.refresh_cookie_name, "", Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            domain: Some("example.com".to_string()),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn refresh_cookie_attributes() {
        let cookie = refresh_cookie(&config(), "r1", 3600);
        let rendered = cookie.to_string();

        assert_eq!(cookie.name(), "broker_refresh");
        assert_eq!(cookie.value(), "r1");
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("Secure"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(rendered.contains("Path=/"));
        assert!(rendered.contains("Domain=example.com"));
        assert!(rendered.contains("Max-Age=3600"));
    }

    #[test]
    fn insecure_cookie_when_configured() {
        let config = SessionConfig {
            secure: false,
            ..SessionConfig::default()
        };
        let rendered = session_cookie(&config, "s1", 60).to_string();
        assert!(!rendered.contains("Secure"));
        assert!(rendered.starts_with("broker_session=s1"));
    }

    #[test]
    fn clearing_cookies_expire_immediately() {
        let rendered = clear_session_cookie(&config()).to_string();
        assert!(rendered.starts_with("broker_session=;"));
        assert!(rendered.contains("Max-Age=0"));

        let rendered = clear_refresh_cookie(&config()).to_string();
        assert!(rendered.starts_with("broker_refresh=;"));
    }
}
