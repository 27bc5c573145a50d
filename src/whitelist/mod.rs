//! Whitelist rule set
//!
//! The rule file maps namespace → app → list of rule strings:
//!
//! ```json
//! {
//!   "teamcrm": {
//!     "sf-arkiv": ["GET /api/.*", "POST /api/arkiv scope:arkiv-write"]
//!   }
//! }
//! ```
//!
//! Every rule is compiled while loading; the first malformed rule aborts
//! startup. The set is read-only afterwards and shared behind an `Arc`.

pub mod rule;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use axum::http::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

pub use rule::{DEFAULT_SCOPE, Rule, evaluate, find_scope};

use crate::{Error, Result};

/// Raw on-disk shape of a namespace → app table
pub type RawTable<V> = BTreeMap<String, BTreeMap<String, V>>;

/// Outcome of looking an app up across namespaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceLookup {
    /// App is not registered anywhere
    NotFound,
    /// App is registered in exactly one namespace
    Found(String),
    /// App is registered in several namespaces
    Ambiguous(Vec<String>),
}

impl NamespaceLookup {
    /// Collapse into a namespace, treating ambiguity as a configuration error
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigAmbiguity`] for [`NamespaceLookup::Ambiguous`].
    pub fn into_namespace(self, app: &str) -> Result<Option<String>> {
        match self {
            Self::NotFound => Ok(None),
            Self::Found(ns) => Ok(Some(ns)),
            Self::Ambiguous(namespaces) => Err(Error::ConfigAmbiguity {
                app: app.to_string(),
                namespaces,
            }),
        }
    }
}

/// Compiled whitelist: namespace → app → ordered rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    namespaces: BTreeMap<String, BTreeMap<String, Vec<Rule>>>,
}

impl RuleSet {
    /// Load and compile a rule file (`.json`, `.yaml` or `.yml`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if any
    /// rule is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw: RawTable<Vec<String>> = load_table(path)?;
        let set = Self::from_raw(raw)?;
        info!(
            path = %path.display(),
            namespaces = set.namespaces.len(),
            apps = set.app_count(),
            "Loaded whitelist"
        );
        Ok(set)
    }

    /// Compile an in-memory table of rule strings
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRule`] naming the namespace and app of the
    /// first rule that fails to compile.
    pub fn from_raw(raw: RawTable<Vec<String>>) -> Result<Self> {
        let mut namespaces = BTreeMap::new();
        for (ns, apps) in raw {
            let mut compiled_apps = BTreeMap::new();
            for (app, rules) in apps {
                let compiled = rules
                    .iter()
                    .map(|r| {
                        Rule::parse(r).map_err(|e| match e {
                            Error::MalformedRule { rule, reason } => Error::MalformedRule {
                                rule,
                                reason: format!("{reason} (namespace {ns}, app {app})"),
                            },
                            other => other,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                compiled_apps.insert(app, compiled);
            }
            namespaces.insert(ns, compiled_apps);
        }
        Ok(Self { namespaces })
    }

    /// Find the namespace an app is registered in
    pub fn namespace_of_app(&self, app: &str) -> NamespaceLookup {
        let mut found: Vec<String> = self
            .namespaces
            .iter()
            .filter(|(_, apps)| apps.contains_key(app))
            .map(|(ns, _)| ns.clone())
            .collect();

        match found.len() {
            0 => NamespaceLookup::NotFound,
            1 => NamespaceLookup::Found(found.remove(0)),
            _ => NamespaceLookup::Ambiguous(found),
        }
    }

    /// Rules configured for `app` in `namespace`, empty if absent
    pub fn rules_of(&self, app: &str, namespace: &str) -> &[Rule] {
        self.namespaces
            .get(namespace)
            .and_then(|apps| apps.get(app))
            .map_or(&[], Vec::as_slice)
    }

    /// Rules for `app` in `namespace` that allow `method` on `path`
    pub fn matching_rules(
        &self,
        app: &str,
        namespace: &str,
        method: &Method,
        path: &str,
    ) -> Vec<&Rule> {
        let matched: Vec<&Rule> = self
            .rules_of(app, namespace)
            .iter()
            .filter(|r| r.matches(method, path))
            .collect();
        debug!(app, namespace, %method, path, matched = matched.len(), "Evaluated whitelist");
        matched
    }

    /// Number of registered apps across all namespaces
    pub fn app_count(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }
}

/// Human-readable dry-run report for the test endpoint
///
/// Returns whether any rule matched and the report text.
pub fn dry_run_report(
    rules: &[Rule],
    target_description: &str,
    method: &Method,
    path: &str,
) -> (bool, String) {
    let mut approved = false;
    let mut report = String::from("Report:\n");
    let _ = writeln!(report, "{target_description}");
    for rule in rules {
        let matched = rule.matches(method, path);
        approved |= matched;
        let _ = writeln!(
            report,
            "Evaluating {rule} on method {method}, path {path} {matched}"
        );
    }
    report.push_str(if approved { "Approved" } else { "Not approved" });
    (approved, report)
}

/// Read a namespace → app table from JSON or YAML, chosen by extension
pub(crate) fn load_table<V: DeserializeOwned>(path: &Path) -> Result<RawTable<V>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read {}: {e}", path.display()))
    })?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("yaml" | "yml") => serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {e}", path.display()))),
        _ => serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {e}", path.display()))),
    }
}
