//! Exchange Proxy Library
//!
//! Authenticating reverse proxy for internal services.
//!
//! # Features
//!
//! - **Whitelist**: per-app `METHOD PATHREGEX [scope:NAME]` rules
//! - **Target resolution**: namespace lookup, ingress or in-cluster service
//! - **Token exchange**: on-behalf-of and client-credentials flows with a
//!   TTL-aware cache (in process or Redis/Valkey)
//! - **Forwarding**: pooled client, no redirects, GET retried once
//! - **Production Ready**: readiness probes, Prometheus metrics, diagnostic
//!   artifacts, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod ingress;
pub mod metrics;
pub mod target;
pub mod token;
pub mod whitelist;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing: {e}"))),
    }
}
