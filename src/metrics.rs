//! Prometheus telemetry.
//!
//! Counters are best-effort observability; nothing reads them back for
//! control flow.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global recorder once. Later calls return the same handle.
pub fn init() -> Option<&'static PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Metrics recorder not installed: {}", e);
                None
            }
        })
        .as_ref()
}

/// Current metrics in Prometheus text format.
pub fn render() -> String {
    init().map(PrometheusHandle::render).unwrap_or_default()
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!("relay_requests_total", "endpoint" => endpoint, "status" => status.to_string()).increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("relay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(kind: &'static str) {
    counter!("relay_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_manifest_rewrite(rewritten: usize, untouched: usize) {
    counter!("relay_manifest_uris_rewritten_total").increment(rewritten as u64);
    if untouched > 0 {
        counter!("relay_manifest_uris_untouched_total").increment(untouched as u64);
    }
}

pub fn record_stream(endpoint: &'static str, outcome: &'static str, bytes: u64) {
    counter!("relay_bytes_streamed_total", "endpoint" => endpoint).increment(bytes);
    counter!("relay_streams_total", "endpoint" => endpoint, "outcome" => outcome).increment(1);
}
