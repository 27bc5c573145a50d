//! Prometheus metrics
//!
//! Counters and histograms go through the `metrics` facade; the Prometheus
//! recorder is installed once at startup and rendered by `/internal/metrics`.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use regex::Regex;
use telemetry_metrics::{Label, counter, gauge, histogram};

use crate::{Error, Result};

/// Millisecond buckets for the forwarded-call latency histograms
pub const LATENCY_BUCKETS_MS: &[f64] = &[
    50.0, 100.0, 200.0, 300.0, 400.0, 500.0, 1000.0, 2000.0, 4000.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static CACHE_FETCH_MAX_MS: AtomicU64 = AtomicU64::new(0);
static CACHE_STORE_MAX_MS: AtomicU64 = AtomicU64::new(0);

/// Install the global Prometheus recorder
///
/// Safe to call more than once; later calls return the first handle.
pub fn install_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("total_ms".to_string()),
            LATENCY_BUCKETS_MS,
        )
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Full("handling_ms".to_string()),
                LATENCY_BUCKETS_MS,
            )
        })
        .map_err(|e| Error::Internal(format!("metrics buckets: {e}")))?
        .install_recorder()
        .map_err(|e| Error::Internal(format!("metrics recorder: {e}")))?;

    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// Render the Prometheus text exposition, `None` if no recorder is installed
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

/// Inbound call to the proxy
pub fn record_api_call(target_app: &str, path: &str) {
    counter!(
        "api_calls",
        "target_app" => target_app.to_string(),
        "path" => mask_path(path)
    )
    .increment(1);
}

/// Inbound call to the dry-run endpoint
pub fn record_test_api_call(path: &str) {
    counter!("test_api_calls", "path" => mask_path(path)).increment(1);
}

/// Call rejected for lack of a valid token
pub fn record_no_auth(target_app: &str) {
    counter!("no_auth", "target_app" => target_app.to_string()).increment(1);
}

/// Identity provider did not return an access token
pub fn record_token_fetch_fail(target_alias: &str, token_type: &str) {
    counter!(
        "token_fetch_fail",
        "target_alias" => target_alias.to_string(),
        "token_type" => token_type.to_string()
    )
    .increment(1);
}

/// Time spent reading the token store
pub fn record_cache_fetch(elapsed: Duration) {
    observe_with_max("cache_fetch_time", "cache_fetch_time_max", &CACHE_FETCH_MAX_MS, elapsed);
}

/// Time spent writing the token store
pub fn record_cache_store(elapsed: Duration) {
    observe_with_max("cache_store_time", "cache_store_time_max", &CACHE_STORE_MAX_MS, elapsed);
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn observe_with_max(name: &'static str, max_name: &'static str, max: &AtomicU64, elapsed: Duration) {
    let ms = elapsed.as_millis() as u64;
    histogram!(name).record(ms as f64);
    let previous = max.fetch_max(ms, Ordering::Relaxed);
    if ms > previous {
        gauge!(max_name).set(ms as f64);
    }
}

/// Outcome of a forwarded call
#[derive(Debug, Clone)]
pub struct ForwardedCall<'a> {
    /// Target app
    pub target_app: &'a str,
    /// Request path (masked when recorded)
    pub path: &'a str,
    /// Ingress, empty for in-cluster targets
    pub ingress: &'a str,
    /// `proxy:obo` or `proxy:m2m`
    pub token_type: &'a str,
    /// Status label: the downstream status, `retry-{status}` or `500`
    pub status: String,
    /// Latency split, recorded only for first-attempt responses
    pub timing: Option<CallTiming>,
}

/// Latency split of a forwarded call
#[derive(Debug, Clone, Copy)]
pub struct CallTiming {
    /// Wall time from request entry to downstream response
    pub total: Duration,
    /// Part of `total` spent in the proxy itself (lookups, token exchange)
    pub handling: Duration,
}

/// Record a forwarded call
#[allow(clippy::cast_precision_loss)]
pub fn record_forwarded_call(call: &ForwardedCall<'_>) {
    counter!(
        "forwarded_calls",
        "target_app" => call.target_app.to_string(),
        "path" => mask_path(call.path),
        "ingress" => call.ingress.to_string(),
        "token_type" => call.token_type.to_string(),
        "status" => call.status.clone()
    )
    .increment(1);

    let Some(timing) = call.timing else {
        return;
    };
    let labels = vec![
        Label::new("targetApp", call.target_app.to_string()),
        Label::new("tokenType", call.token_type.to_string()),
        Label::new("status", call.status.clone()),
    ];
    histogram!("total_ms", labels.clone()).record(timing.total.as_millis() as f64);
    histogram!("handling_ms", labels).record(timing.handling.as_millis() as f64);
}

/// Collapse variable path segments so label cardinality stays bounded
///
/// Numeric segments become `{id}`, a capital letter followed by four or
/// more digits becomes `{ident}`, a trailing `.xml`/`.pdf` file name becomes
/// `{filename}` and a segment of exactly three capital letters becomes
/// `{code}`.
pub fn mask_path(path: &str) -> String {
    static ID: OnceLock<Regex> = OnceLock::new();
    static IDENT: OnceLock<Regex> = OnceLock::new();
    static FILENAME: OnceLock<Regex> = OnceLock::new();

    let id = ID.get_or_init(|| Regex::new(r"/\d+").expect("static regex"));
    let ident = IDENT.get_or_init(|| Regex::new(r"/[A-Z]\d{4,}").expect("static regex"));
    let filename =
        FILENAME.get_or_init(|| Regex::new(r"/[^/]+\.(xml|pdf)$").expect("static regex"));

    let masked = id.replace_all(path, "/{id}");
    let masked = ident.replace_all(&masked, "/{ident}");
    let masked = filename.replace_all(&masked, "/{filename}");

    // A leading segment has no slash in front of it and is left alone
    let mut segments = masked.split('/');
    let mut out = segments.next().unwrap_or_default().to_string();
    for segment in segments {
        out.push('/');
        if segment.len() == 3 && segment.bytes().all(|b| b.is_ascii_uppercase()) {
            out.push_str("{code}");
        } else {
            out.push_str(segment);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn masks_numeric_segments() {
        assert_eq!(
            mask_path("norg2/api/v1/enhet/0602/kontaktinformasjon"),
            "norg2/api/v1/enhet/{id}/kontaktinformasjon"
        );
        assert_eq!(
            mask_path("/norg2/api/v1/enhet/0702/kontaktinformasjon"),
            "/norg2/api/v1/enhet/{id}/kontaktinformasjon"
        );
    }

    #[test]
    fn masks_idents_codes_and_files() {
        assert_eq!(mask_path("/person/Z123456/info"), "/person/{ident}/info");
        assert_eq!(mask_path("/land/NOR"), "/land/{code}");
        assert_eq!(mask_path("/land/NOR/by"), "/land/{code}/by");
        assert_eq!(mask_path("/doc/report-final.pdf"), "/doc/{filename}");
        assert_eq!(mask_path("/doc/data.xml"), "/doc/{filename}");
    }

    #[test]
    fn leaves_other_segments() {
        assert_eq!(mask_path("/land/NORW"), "/land/NORW");
        assert_eq!(mask_path("/land/Nor"), "/land/Nor");
        assert_eq!(mask_path("/doc/data.json"), "/doc/data.json");
        assert_eq!(mask_path("/"), "/");
        assert_eq!(mask_path(""), "");
    }

    #[test]
    fn numbers_are_masked_before_idents() {
        // digits directly after a slash are an id even when longer
        assert_eq!(mask_path("/123456789"), "/{id}");
        assert_eq!(mask_path("/12abc"), "/{id}abc");
    }

    #[test]
    fn recorder_installs_once() {
        let first = install_recorder().unwrap();
        let second = install_recorder().unwrap();
        record_api_call("app", "/x/1");
        assert!(second.render().contains("api_calls"));
        drop(first);
        assert!(render().is_some());
    }
}
