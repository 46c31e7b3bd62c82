//! Credential Broker - server-side sessions for browser and mobile clients

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use credential_broker::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => match run_server(&cli).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Broker failed");
                ExitCode::FAILURE
            }
        },
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }

    Ok(config)
}

/// Validate configuration and exit
fn run_check_config(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Ok(config) => {
            println!("Configuration OK");
            println!("  listen:   {}:{}", config.server.host, config.server.port);
            println!("  backend:  {}", config.upstream.api_base);
            println!("  sso:      {}", config.upstream.sso_url);
            println!("  store:    {:?}", config.store.backend);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the broker server
async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting credential broker"
    );

    Gateway::new(config).run().await.context("Server error")?;

    info!("Broker stopped");
    Ok(())
}
