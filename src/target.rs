//! Target resolution: where a call goes and which audience its token is for

use crate::Result;
use crate::ingress::IngressSet;
use crate::whitelist::RuleSet;

/// Resolved destination of a proxied call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Target app name (from the `target-app` header)
    pub app: String,
    /// Namespace, empty if unknown
    pub namespace: String,
    /// Ingress base URL, if the app is reached through one
    pub ingress: Option<String>,
    /// Base URL the request path is appended to
    pub base_url: String,
    /// Token audience alias, `{cluster}.{namespace}.{app}`
    pub alias: String,
}

impl Target {
    /// Resolve a target from the request headers and the loaded tables
    ///
    /// `namespace_header` wins over the rule set lookup. An app that is
    /// registered in several namespaces without a namespace header is a
    /// configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConfigAmbiguity`] in that case.
    pub fn resolve(
        app: &str,
        namespace_header: Option<&str>,
        rules: &RuleSet,
        ingresses: &IngressSet,
        cluster: &str,
    ) -> Result<Self> {
        let namespace = match namespace_header {
            Some(ns) => ns.to_string(),
            None => rules
                .namespace_of_app(app)
                .into_namespace(app)?
                .unwrap_or_default(),
        };
        let ingress = ingresses.ingress_of(app, &namespace).map(String::from);
        Ok(Self::new(app, namespace, ingress, cluster))
    }

    /// Build a target from already resolved parts
    pub fn new(app: &str, namespace: String, ingress: Option<String>, cluster: &str) -> Self {
        let base_url = ingress
            .clone()
            .unwrap_or_else(|| format!("http://{app}.{namespace}"));
        let alias = format!(
            "{}.{namespace}.{app}",
            target_cluster(cluster, ingress.is_some())
        );
        Self {
            app: app.to_string(),
            namespace,
            ingress,
            base_url,
            alias,
        }
    }

    /// One-line description used in the dry-run report
    pub fn describe(&self) -> String {
        match &self.ingress {
            Some(ingress) => format!("Targets ingress {ingress}"),
            None => format!("Targets service {}", self.base_url),
        }
    }
}

/// Cluster name used in the token alias
///
/// Apps behind an ingress live on-premises, so a `gcp` cluster name is
/// swapped for its `fss` counterpart.
pub fn target_cluster(cluster: &str, via_ingress: bool) -> String {
    if via_ingress {
        cluster.replace("gcp", "fss")
    } else {
        cluster.to_string()
    }
}
