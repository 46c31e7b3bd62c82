//! Credential Broker Library
//!
//! A backend-for-frontend that keeps backend bearer tokens on the server.
//! Clients log in with an SSO ticket or a login/password, receive an opaque
//! session handle plus a single-use refresh handle, and every proxied request
//! has the handle swapped for the real token.
//!
//! # Features
//!
//! - **SSO exchange**: ticket validation, then a backend token grant
//! - **Password grant**: direct credentials against the user token endpoint
//! - **Sessions**: last login wins, lazy expiry, IP binding
//! - **Refresh rotation**: rotate-on-use, replay fails closed
//! - **Authorizing proxy**: passthrough, service credential injection, session required
//! - **Stores**: in-memory (tests, single instance) or Redis

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod session;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
    }

    Ok(())
}
