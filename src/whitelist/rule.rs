//! Whitelist rule parsing and evaluation
//!
//! A rule is a single line of the form `METHOD PATHREGEX [scope:NAME]`:
//!
//! ```text
//! GET /api/v1/person/.*
//! POST /done scope:consumer-x
//! ```
//!
//! The path regex must match the *whole* request path. Rules are compiled
//! once when the rule file is loaded.

use std::fmt;

use axum::http::Method;
use regex::Regex;

use crate::{Error, Result};

/// Scope used when no rule in a list carries an explicit `scope:` annotation
pub const DEFAULT_SCOPE: &str = "defaultaccess";

/// Method tokens accepted in rule strings
const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH", "PURGE",
];

/// A compiled whitelist rule
#[derive(Debug, Clone)]
pub struct Rule {
    raw: String,
    method: Method,
    pattern: Regex,
    scope: Option<String>,
}

impl Rule {
    /// Parse and compile a rule string
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRule`] if the method token is not an HTTP
    /// method name, the path token is missing, or the path regex does not
    /// compile.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();

        let method_part = parts
            .next()
            .ok_or_else(|| Error::malformed_rule(raw, "empty rule"))?;
        if !METHODS.contains(&method_part) {
            return Err(Error::malformed_rule(
                raw,
                format!("unknown method '{method_part}'"),
            ));
        }
        let method = Method::from_bytes(method_part.as_bytes())
            .map_err(|e| Error::malformed_rule(raw, e.to_string()))?;

        let path_part = parts
            .next()
            .ok_or_else(|| Error::malformed_rule(raw, "missing path pattern"))?;
        let pattern = Regex::new(&format!("^(?:{path_part})$"))
            .map_err(|e| Error::malformed_rule(raw, e.to_string()))?;

        // Third token is the scope; the `scope:` prefix is optional in older files
        let scope = parts
            .next()
            .map(|s| s.strip_prefix("scope:").unwrap_or(s))
            .filter(|s| !s.is_empty())
            .map(String::from);

        Ok(Self {
            raw: raw.to_string(),
            method,
            pattern,
            scope,
        })
    }

    /// Whether this rule allows `method` on `path`
    ///
    /// `path` is the request path including the leading `/`.
    #[must_use]
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method == *method && self.pattern.is_match(path)
    }

    /// HTTP method of the rule
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Explicit scope, if the rule carries one
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// The rule as written in the rule file
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse `raw` and evaluate it against a request in one go
///
/// # Errors
///
/// Returns [`Error::MalformedRule`] if `raw` does not parse.
pub fn evaluate(raw: &str, method: &Method, path: &str) -> Result<bool> {
    Ok(Rule::parse(raw)?.matches(method, path))
}

/// Scope to request for a list of rules
///
/// The first rule in configured order that carries a scope wins; if none
/// does, [`DEFAULT_SCOPE`] is returned.
pub fn find_scope<'a, I>(rules: I) -> &'a str
where
    I: IntoIterator<Item = &'a Rule>,
{
    rules
        .into_iter()
        .find_map(Rule::scope)
        .unwrap_or(DEFAULT_SCOPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(raw: &str, method: Method, path: &str) -> bool {
        evaluate(raw, &method, path).unwrap()
    }

    #[test]
    fn method_must_match_exactly() {
        assert!(eval("POST /done", Method::POST, "/done"));
        assert!(!eval("GET /done", Method::POST, "/done"));
    }

    #[test]
    fn path_must_match_fully() {
        assert!(!eval("GET /done", Method::GET, "/don"));
        assert!(!eval("GET /done", Method::GET, "/done/"));
        assert!(!eval("GET /done", Method::GET, "/prefix/done"));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(eval(
            "GET /path/.*/ending",
            Method::GET,
            "/path/something/in/the/middle/ending"
        ));
        assert!(eval("GET /api/.*", Method::GET, "/api/x/y"));
        assert!(!eval("GET /api/.*", Method::GET, "/something/in/the/end"));
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        // Without the non-capturing group `/a|/b` would only be anchored on one side
        assert!(eval("GET /a|/b", Method::GET, "/b"));
        assert!(!eval("GET /a|/b", Method::GET, "/a/extra"));
        assert!(!eval("GET /a|/b", Method::GET, "/x/b"));
    }

    #[test]
    fn unknown_method_is_malformed() {
        let err = Rule::parse("GE /path").unwrap_err();
        assert!(matches!(err, Error::MalformedRule { .. }));

        // lower case is not an HTTP method name
        assert!(Rule::parse("get /path").is_err());
    }

    #[test]
    fn missing_path_is_malformed() {
        assert!(matches!(
            Rule::parse("GET").unwrap_err(),
            Error::MalformedRule { .. }
        ));
        assert!(Rule::parse("").is_err());
    }

    #[test]
    fn invalid_regex_is_malformed() {
        assert!(matches!(
            Rule::parse("GET /api/(unclosed").unwrap_err(),
            Error::MalformedRule { .. }
        ));
    }

    #[test]
    fn scope_defaults_when_absent() {
        let rules = vec![Rule::parse("POST /done").unwrap()];
        assert_eq!(find_scope(&rules), "defaultaccess");
        assert_eq!(find_scope(&Vec::<Rule>::new()), DEFAULT_SCOPE);
    }

    #[test]
    fn scope_suffix_is_stripped() {
        let rules = vec![Rule::parse("POST /done scope:consumer-x").unwrap()];
        assert_eq!(find_scope(&rules), "consumer-x");
    }

    #[test]
    fn first_rule_with_scope_wins() {
        let rules = vec![
            Rule::parse("GET /a").unwrap(),
            Rule::parse("GET /b scope:first").unwrap(),
            Rule::parse("GET /c scope:second").unwrap(),
        ];
        assert_eq!(find_scope(&rules), "first");
    }

    #[test]
    fn display_is_the_raw_rule() {
        let rule = Rule::parse("GET /api/.* scope:x").unwrap();
        assert_eq!(rule.to_string(), "GET /api/.* scope:x");
        assert_eq!(rule.method(), &Method::GET);
    }
}
