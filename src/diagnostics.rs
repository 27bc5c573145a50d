//! Diagnostic artifact files
//!
//! Each file holds the most recent occurrence of one kind of event
//! (`notwhitelisted-{app}`, `latest-{app}-{status}`, ...) so an operator
//! can inspect the last failing exchange from inside the pod. Writes are
//! best-effort: failures are logged and never reach the caller.

use std::fmt::Write as _;
use std::path::PathBuf;

use axum::http::{HeaderMap, Method, StatusCode, header};
use tracing::{debug, warn};

use crate::config::DiagnosticsConfig;

/// Writer for diagnostic artifacts
#[derive(Debug, Clone)]
pub struct Diagnostics {
    config: DiagnosticsConfig,
}

impl Diagnostics {
    /// Create a writer from configuration
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self { config }
    }

    /// A writer that never touches the filesystem
    pub fn disabled() -> Self {
        Self {
            config: DiagnosticsConfig {
                enabled: false,
                ..DiagnosticsConfig::default()
            },
        }
    }

    /// Path an artifact named `name` is written to
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.config.dir.join(sanitize(name))
    }

    /// Overwrite the artifact `name` with `content`, prefixed by a timestamp
    pub async fn write(&self, name: &str, content: &str) {
        if !self.config.enabled {
            return;
        }
        let path = self.path_of(name);
        let body = format!("{}\n\n{content}", chrono::Local::now().to_rfc3339());

        if let Err(e) = tokio::fs::create_dir_all(&self.config.dir).await {
            warn!(dir = %self.config.dir.display(), error = %e, "Failed to create diagnostics dir");
            return;
        }
        match tokio::fs::write(&path, body).await {
            Ok(()) => debug!(path = %path.display(), "Wrote diagnostic"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write diagnostic"),
        }
    }

    /// Whether a downstream response with `status` gets a `latest-*` artifact
    ///
    /// Failures are recorded unless listed in `ignore_statuses`; successes
    /// only when listed in `always_statuses`.
    pub fn records_status(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        if self.config.always_statuses.contains(&code) {
            return true;
        }
        !status.is_success() && !self.config.ignore_statuses.contains(&code)
    }
}

/// Render a request for an artifact, with bearer tokens redacted
pub fn describe_request(method: &Method, uri: &str, headers: &HeaderMap) -> String {
    let mut out = format!("{method} {uri}\n");
    for (name, value) in headers {
        let value = if name == header::AUTHORIZATION {
            "<redacted>"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        let _ = writeln!(out, "{name}: {value}");
    }
    out
}

/// Render a downstream response for an artifact
pub fn describe_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> String {
    let mut out = format!("{status}\n");
    for (name, value) in headers {
        let _ = writeln!(out, "{name}: {}", value.to_str().unwrap_or("<binary>"));
    }
    out.push('\n');
    out.push_str(&String::from_utf8_lossy(body));
    out
}

/// Keep artifact names inside the diagnostics directory
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn enabled(dir: &std::path::Path) -> Diagnostics {
        Diagnostics::new(DiagnosticsConfig {
            enabled: true,
            dir: dir.to_path_buf(),
            ..DiagnosticsConfig::default()
        })
    }

    #[tokio::test]
    async fn writes_artifact_with_timestamp() {
        // GIVEN: an enabled writer
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = enabled(dir.path());

        // WHEN: an artifact is written twice
        diagnostics.write("noauth-app", "first").await;
        diagnostics.write("noauth-app", "second").await;

        // THEN: the latest content wins
        let content = std::fs::read_to_string(dir.path().join("noauth-app")).unwrap();
        assert!(content.ends_with("second"));
        assert!(!content.contains("first"));
    }

    #[tokio::test]
    async fn disabled_writer_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(DiagnosticsConfig {
            enabled: false,
            dir: dir.path().to_path_buf(),
            ..DiagnosticsConfig::default()
        });

        diagnostics.write("missingheader", "x").await;

        assert!(!dir.path().join("missingheader").exists());
    }

    #[test]
    fn names_cannot_escape_dir() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = enabled(dir.path());

        let path = diagnostics.path_of("latest-../../etc/passwd-500");
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(sanitize("../x"), "_x");
    }

    #[test]
    fn status_policy() {
        let diagnostics = Diagnostics::disabled();
        assert!(diagnostics.records_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(diagnostics.records_status(StatusCode::BAD_REQUEST));
        assert!(diagnostics.records_status(StatusCode::CREATED));
        assert!(!diagnostics.records_status(StatusCode::NOT_FOUND));
        assert!(!diagnostics.records_status(StatusCode::OK));
    }

    #[test]
    fn request_description_redacts_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert("target-app", HeaderValue::from_static("app"));

        let text = describe_request(&Method::GET, "/api/x?y=1", &headers);

        assert!(text.starts_with("GET /api/x?y=1\n"));
        assert!(text.contains("target-app: app"));
        assert!(!text.contains("secret"));
    }
}
