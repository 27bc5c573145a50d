//! Ingress table: namespace → app → external base URL
//!
//! Apps listed here are reached through their ingress instead of the
//! in-cluster service address.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::whitelist::{RawTable, load_table};
use crate::{Error, Result};

/// Read-only ingress lookup table
#[derive(Debug, Clone, Default)]
pub struct IngressSet {
    namespaces: RawTable<String>,
}

impl IngressSet {
    /// Load an ingress file (`.json`, `.yaml` or `.yml`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an entry
    /// is not an absolute `http(s)` URL.
    pub fn load(path: &Path) -> Result<Self> {
        let set = Self::from_raw(load_table(path)?)?;
        info!(path = %path.display(), entries = set.len(), "Loaded ingresses");
        Ok(set)
    }

    /// Validate an in-memory table
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for entries that are not `http(s)` URLs.
    pub fn from_raw(raw: RawTable<String>) -> Result<Self> {
        for (ns, apps) in &raw {
            for (app, ingress) in apps {
                if !(ingress.starts_with("https://") || ingress.starts_with("http://")) {
                    return Err(Error::Config(format!(
                        "Ingress for {ns}/{app} must start with http:// or https://, got '{ingress}'"
                    )));
                }
            }
        }
        Ok(Self { namespaces: raw })
    }

    /// Ingress configured for `app` in `namespace`
    pub fn ingress_of(&self, app: &str, namespace: &str) -> Option<&str> {
        self.namespaces
            .get(namespace)
            .and_then(|apps| apps.get(app))
            .map(String::as_str)
    }

    /// Number of configured ingresses
    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    /// Whether no ingress is configured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
