//! Prometheus metrics exposition
//!
//! Service-level series:
//!
//! - `relay_requests_total` (counter): label `status`
//! - `relay_request_duration_seconds` (histogram): label `status`
//!
//! The key pool and dispatcher emit `key_pool_*` and `dispatch_attempts_total`
//! through the same global recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::error::Error;

const REQUEST_DURATION: &str = "relay_request_duration_seconds";

/// Bucket boundaries from 5ms up to the 600s upstream timeout. A request may
/// span several upstream calls plus backoff, so the top buckets are wide.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Explicit buckets make the duration series render as a Prometheus histogram
/// (with `_bucket` lines for `histogram_quantile()`) instead of a summary.
pub fn install_recorder() -> Result<PrometheusHandle, Error> {
    builder()
        .map_err(|e| Error::Metrics(e.to_string()))?
        .install_recorder()
        .map_err(|e| Error::Metrics(e.to_string()))
}

/// Record a completed `/generate` request.
pub fn record_request(status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("relay_requests_total", "status" => status_str.clone()).increment(1);
    metrics::histogram!(REQUEST_DURATION, "status" => status_str).record(duration_secs);
}
