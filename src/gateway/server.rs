//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::router::{AppState, create_router};
use crate::config::{CacheBackend, Config};
use crate::diagnostics::Diagnostics;
use crate::forward::HttpForwarder;
use crate::ingress::IngressSet;
use crate::metrics;
use crate::token::{MemoryTokenStore, OidcTokenValidator, RedisTokenStore, TokenExchanger, TokenStore};
use crate::whitelist::RuleSet;
use crate::{Error, Result};

/// Exchange proxy server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// State shared by all handlers
    state: Arc<AppState>,
}

impl Gateway {
    /// Load the tables, connect the token store and build the clients
    ///
    /// # Errors
    ///
    /// Returns an error if a table fails to load, a rule is malformed, the
    /// token store cannot be reached or an HTTP client cannot be built.
    pub async fn new(config: Config) -> Result<Self> {
        metrics::install_recorder()?;

        let rules = RuleSet::load(&config.whitelist.rules_file)?;
        let ingresses = match &config.whitelist.ingress_file {
            Some(path) => IngressSet::load(path)?,
            None => IngressSet::default(),
        };

        let diagnostics = Diagnostics::new(config.diagnostics.clone());

        let store: Arc<dyn TokenStore> = match config.cache.backend {
            CacheBackend::Memory => Arc::new(MemoryTokenStore::new(config.cache.read_margin)),
            CacheBackend::Redis => Arc::new(RedisTokenStore::connect(&config.cache.redis).await?),
        };

        let idp = TokenExchanger::idp_client(&config.identity)?;
        let verifier = Arc::new(OidcTokenValidator::new(idp.clone(), &config.identity));
        let provider = Arc::new(TokenExchanger::new(
            idp,
            &config.identity,
            Arc::clone(&store),
            diagnostics.clone(),
        ));
        let forwarder = Arc::new(HttpForwarder::new(&config.http)?);

        let state = Arc::new(AppState {
            rules: Arc::new(rules),
            ingresses: Arc::new(ingresses),
            cluster: config.cluster.name.clone(),
            verifier,
            provider,
            store,
            forwarder,
            diagnostics,
            max_body_size: config.server.max_body_size,
        });

        Ok(Self { config, state })
    }

    /// Run until SIGINT/SIGTERM, then drain for up to `shutdown_timeout`
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("EXCHANGE PROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(
            apps = self.state.rules.app_count(),
            ingresses = self.state.ingresses.len(),
            cluster = %self.state.cluster,
            cache = ?self.config.cache.backend,
            "Tables loaded"
        );
        info!("============================================================");

        self.state.diagnostics.write("started", "started").await;

        let (stopping_tx, mut stopping_rx) = watch::channel(false);
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(stopping_tx))
            .into_future();

        let grace = self.config.server.shutdown_timeout;
        let deadline = async move {
            let _ = stopping_rx.wait_for(|stopping| *stopping).await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = serve => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = deadline => warn!(grace_ms = grace.as_millis(), "Graceful shutdown timed out, dropping open connections"),
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(stopping: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
    let _ = stopping.send(true);
}
