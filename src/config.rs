//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` references.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Rule and ingress files
    pub whitelist: WhitelistConfig,
    /// Identity provider (token validation and exchange)
    pub identity: IdentityConfig,
    /// Token cache
    pub cache: CacheConfig,
    /// Downstream HTTP client
    pub http: HttpConfig,
    /// Diagnostic artifact files
    pub diagnostics: DiagnosticsConfig,
    /// Cluster this proxy runs in
    pub cluster: ClusterConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or a required value is missing after `env:` resolution.
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

        // EXCHANGE_PROXY_IDENTITY__CLIENT_ID -> identity.client_id
        figment = figment.merge(Env::prefixed("EXCHANGE_PROXY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.resolve_env_refs();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
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

    /// Replace `env:VAR` values with the content of `VAR`
    fn resolve_env_refs(&mut self) {
        let id = &mut self.identity;
        for value in [
            &mut id.discovery_url,
            &mut id.token_endpoint,
            &mut id.client_id,
            &mut id.client_secret,
            &mut self.cluster.name,
            &mut self.cache.redis.host,
        ] {
            *value = resolve_env_ref(value);
        }
        for value in [&mut self.cache.redis.username, &mut self.cache.redis.password]
            .into_iter()
            .flatten()
        {
            *value = resolve_env_ref(value);
        }
    }

    /// Check that everything needed to serve traffic is present
    fn validate(&self) -> Result<()> {
        let required = [
            ("identity.discovery_url", &self.identity.discovery_url),
            ("identity.token_endpoint", &self.identity.token_endpoint),
            ("identity.client_id", &self.identity.client_id),
            ("identity.client_secret", &self.identity.client_secret),
            ("cluster.name", &self.cluster.name),
        ];
        for (key, value) in required {
            if value.is_empty() || value.starts_with("env:") {
                return Err(Error::Config(format!("{key} is not set ({value:?})")));
            }
        }
        Ok(())
    }
}

/// Resolve a single `env:VAR` reference, leaving other values untouched
///
/// An unset variable leaves the reference as is so validation can name it.
#[must_use]
pub fn resolve_env_ref(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var) => env::var(var).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum inbound request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 32 * 1024 * 1024,
        }
    }
}

/// Location of the rule and ingress tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    /// Rule file (JSON or YAML)
    pub rules_file: PathBuf,
    /// Ingress file (JSON or YAML); no ingresses if unset
    pub ingress_file: Option<PathBuf>,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::from("whitelist/rules.json"),
            ingress_file: None,
        }
    }
}

/// Identity provider settings
///
/// String values accept `env:VAR`; the defaults read the variables the
/// platform injects into the pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// OpenID discovery document URL
    pub discovery_url: String,
    /// Token endpoint used for exchange
    pub token_endpoint: String,
    /// This proxy's client id (also an accepted inbound audience)
    pub client_id: String,
    /// This proxy's client secret
    pub client_secret: String,
    /// Additional accepted inbound audiences
    pub extra_audiences: Vec<String>,
    /// Claim that marks a token as issued on behalf of a user
    pub user_claim: String,
    /// IdP connect timeout
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// IdP total request timeout
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Attempts per token request (first call included)
    pub retry_attempts: usize,
    /// Fixed delay between attempts
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,
    /// Concurrent token requests to the IdP
    pub max_in_flight: usize,
    /// Token validated by the readiness probe; a built-in sample is used if unset
    pub probe_token: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            discovery_url: "env:AZURE_APP_WELL_KNOWN_URL".to_string(),
            token_endpoint: "env:AZURE_OPENID_CONFIG_TOKEN_ENDPOINT".to_string(),
            client_id: "env:AZURE_APP_CLIENT_ID".to_string(),
            client_secret: "env:AZURE_APP_CLIENT_SECRET".to_string(),
            extra_audiences: Vec::new(),
            user_claim: "NAVident".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            max_in_flight: 20,
            probe_token: None,
        }
    }
}

/// Which token store backs the exchange cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process map
    #[default]
    Memory,
    /// Shared Redis/Valkey instance
    Redis,
}

/// Token cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store implementation
    pub backend: CacheBackend,
    /// In-memory entries closer than this to expiry are treated as misses
    #[serde(with = "duration_serde")]
    pub read_margin: Duration,
    /// Redis connection settings (used when `backend` is `redis`)
    pub redis: RedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            read_margin: Duration::from_secs(10),
            redis: RedisConfig::default(),
        }
    }
}

/// Redis/Valkey connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
    /// Username (ACL), if any
    pub username: Option<String>,
    /// Password, if any
    pub password: Option<String>,
    /// Connect with TLS (`rediss://`)
    pub tls: bool,
    /// A readiness probe slower than this counts as not ready
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            tls: false,
            probe_timeout: Duration::from_millis(100),
        }
    }
}

/// Downstream HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Connect timeout
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// Total request timeout
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Idle pooled connections kept per host
    pub max_idle_per_host: usize,
    /// Concurrent downstream calls across all hosts
    pub max_in_flight: usize,
    /// Concurrent downstream calls to one origin
    pub max_per_route: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            max_idle_per_host: 100,
            max_in_flight: 500,
            max_per_route: 100,
        }
    }
}

/// Diagnostic artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Write artifact files at all
    pub enabled: bool,
    /// Directory artifacts are written to
    pub dir: PathBuf,
    /// Downstream statuses that never produce a `latest-*` artifact
    pub ignore_statuses: Vec<u16>,
    /// Successful statuses that still produce a `latest-*` artifact
    pub always_statuses: Vec<u16>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("/tmp/exchange-proxy"),
            ignore_statuses: vec![404],
            always_statuses: vec![201],
        }
    }
}

/// Cluster identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name, e.g. `prod-gcp`; used in token aliases
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "env:NAIS_CLUSTER_NAME".to_string(),
        }
    }
}

/// Serde helpers for durations written as `"30s"`, `"5m"` or `"100ms"`
pub mod duration_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds (`"1500ms"`)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    /// Deserialize `"100ms"`, `"30s"`, `"5m"`, a bare number of seconds,
    /// or an integer
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a duration string
    ///
    /// # Errors
    ///
    /// Returns a message if the string is not a known duration format.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let num = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };
        // "ms" must be checked before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            num(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            num(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            num(mins).map(|m| Duration::from_secs(m * 60))
        } else {
            num(s).map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "EXCHANGE_PROXY_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(
            env::var("EXCHANGE_PROXY_TEST_KEY_A").unwrap(),
            "hello_from_env_file"
        );
        assert_eq!(
            resolve_env_ref("env:EXCHANGE_PROXY_TEST_KEY_A"),
            "hello_from_env_file"
        );
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_unset_env_ref_is_kept() {
        assert_eq!(
            resolve_env_ref("env:EXCHANGE_PROXY_TEST_DEFINITELY_UNSET"),
            "env:EXCHANGE_PROXY_TEST_DEFINITELY_UNSET"
        );
        assert_eq!(resolve_env_ref("plain"), "plain");
    }

    #[test]
    fn test_validate_names_missing_key() {
        let config = Config {
            cluster: ClusterConfig {
                name: "dev-gcp".to_string(),
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("identity.discovery_url"));
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
server:
  port: 9090
whitelist:
  rules_file: /etc/proxy/rules.yaml
identity:
  client_id: proxy
  retry_delay: 250ms
cache:
  backend: redis
  redis:
    host: valkey
    tls: true
diagnostics:
  ignore_statuses: []
cluster:
  name: prod-gcp
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.identity.retry_delay, Duration::from_millis(250));
        assert_eq!(config.identity.retry_attempts, 3);
        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert!(config.cache.redis.tls);
        assert!(config.diagnostics.ignore_statuses.is_empty());
        assert_eq!(config.cluster.name, "prod-gcp");
    }

    #[test]
    fn test_duration_formats() {
        assert_eq!(duration_serde::parse("100ms"), Ok(Duration::from_millis(100)));
        assert_eq!(duration_serde::parse("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(duration_serde::parse("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(duration_serde::parse("7"), Ok(Duration::from_secs(7)));
        assert!(duration_serde::parse("soon").is_err());
    }
}
