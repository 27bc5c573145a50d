//! Exchange Proxy - authenticating reverse proxy with OAuth2 token exchange

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use exchange_proxy::{cli::Cli, config::Config, gateway::Gateway, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run_server(cli).await {
        Ok(()) => {
            info!("Exchange proxy shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the proxy server
async fn run_server(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        rules = %config.whitelist.rules_file.display(),
        "Starting exchange proxy"
    );

    let gateway = Gateway::new(config)
        .await
        .context("Failed to create proxy")?;

    gateway.run().await.context("Proxy error")
}
