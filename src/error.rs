//! Error types for the exchange proxy

use std::io;

use thiserror::Error;

/// Result type alias for the exchange proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Exchange proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An app is registered under more than one namespace and the caller
    /// did not say which one it meant
    #[error("App {app} found in namespaces {namespaces:?} and no namespace header provided - cannot deduce ruleset")]
    ConfigAmbiguity {
        /// Target app
        app: String,
        /// Every namespace the app was found in
        namespaces: Vec<String>,
    },

    /// A whitelist rule string could not be parsed
    #[error("Malformed rule '{rule}': {reason}")]
    MalformedRule {
        /// The raw rule text
        rule: String,
        /// Why it was rejected
        reason: String,
    },

    /// The identity provider did not hand out an access token
    #[error("Failed to fetch {token_type} access token for {alias}: {reason}")]
    TokenExchange {
        /// Target alias the token was requested for
        alias: String,
        /// `obo` or `m2m`
        token_type: &'static str,
        /// Short diagnostic
        reason: String,
    },

    /// Token store failure
    #[error("Token cache error: {0}")]
    Cache(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::MalformedRule`]
    pub fn malformed_rule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Cache(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguity_message_names_every_namespace() {
        let err = Error::ConfigAmbiguity {
            app: "sf-arkiv".to_string(),
            namespaces: vec!["teamcrm".to_string(), "teamnks".to_string()],
        };

        let msg = err.to_string();
        assert!(msg.contains("sf-arkiv"));
        assert!(msg.contains("teamcrm"));
        assert!(msg.contains("teamnks"));
    }

    #[test]
    fn token_exchange_message_names_alias_and_type() {
        let err = Error::TokenExchange {
            alias: "dev-gcp.team.app".to_string(),
            token_type: "obo",
            reason: "no access_token".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to fetch obo access token for dev-gcp.team.app: no access_token"
        );
    }
}
