//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Authenticating reverse proxy with OAuth2 token exchange
#[derive(Parser, Debug)]
#[command(name = "exchange-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "EXCHANGE_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "EXCHANGE_PROXY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "EXCHANGE_PROXY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "EXCHANGE_PROXY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "EXCHANGE_PROXY_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "exchange-proxy",
            "--config",
            "proxy.yaml",
            "--port",
            "9090",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("proxy.yaml")));
        assert_eq!(cli.port, Some(9090));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }
}
