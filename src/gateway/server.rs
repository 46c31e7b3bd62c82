//! Broker server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::proxy::{Forwarder, build_proxy_client};
use super::request::ConnectionAddrs;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::exchange::upstream::build_http_client;
use crate::exchange::{HttpTicketValidator, HttpTokenAuthority, ServiceCredential};
use crate::store;
use crate::{Error, Result};

/// Credential broker server
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a new server from validated configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal arrives, then close the store.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let store = store::connect(&config.store, shutdown_tx.subscribe()).await?;

        let http = build_http_client(config.upstream.timeout)?;
        let validator = Arc::new(HttpTicketValidator::new(
            http.clone(),
            config.upstream.sso_validate_url(),
        ));
        let authority = Arc::new(HttpTokenAuthority::new(
            http,
            &config.upstream,
            ServiceCredential::new(&config.security.client_id, &config.security.client_secret),
        ));
        let forwarder = Forwarder::new(
            build_proxy_client(config.upstream.timeout)?,
            config.upstream.api_base.clone(),
        );

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("CREDENTIAL BROKER v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = %config.server.port, "Listening");
        info!(api_base = %config.upstream.api_base, "Backend");
        info!(sso_url = %config.upstream.sso_url, "SSO validator");
        info!(backend = ?config.store.backend, "Session store");
        if !config.session.secure {
            warn!("Session cookies are not marked Secure");
        }
        info!("============================================================");

        let state = Arc::new(AppState::new(
            config,
            Arc::clone(&store),
            validator,
            authority,
            forwarder,
        ));
        let app = create_router(state);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<ConnectionAddrs>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Closing session store...");
        store.close().await?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
