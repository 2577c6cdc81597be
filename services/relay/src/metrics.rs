//! Prometheus metrics exposition
//!
//! Registered by the relay:
//!
//! - `relay_translations_total` (counter): label `outcome`
//! - `relay_translation_duration_seconds` (histogram): label `outcome`
//! - `relay_upstream_errors_total` (counter): label `error_type`
//! - `relay_identity_rotation_requested` (gauge): 1 once a restart is pending
//!
//! The quota-pool crate adds rotation, usage and drift metrics through the
//! same recorder.

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "relay_translation_duration_seconds";

/// Bucket boundaries from 5ms to 30s, the range of the provider call timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a finished translation request.
pub fn record_translation(outcome: &str, duration_secs: f64) {
    metrics::counter!("relay_translations_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!(DURATION_METRIC, "outcome" => outcome.to_string()).record(duration_secs);
}

/// Record a failed provider call with its classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("relay_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn set_rotation_requested() {
    metrics::gauge!("relay_identity_rotation_requested").set(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_translation("ok", 0.05);
        record_upstream_error("transient");
        set_rotation_requested();
    }

    /// Isolated recorder/handle pair; only one global recorder can exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_translation_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_translation("ok", 0.042);
        record_translation("limit_reached", 0.0001);

        let output = handle.render();
        assert!(output.contains("relay_translations_total{outcome=\"ok\"} 1"));
        assert!(output.contains("outcome=\"limit_reached\""));
        assert!(
            output.contains("relay_translation_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"30\""));
    }

    #[test]
    fn record_upstream_error_carries_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("quota_exceeded");
        record_upstream_error("permanent");

        let output = handle.render();
        assert!(output.contains("error_type=\"quota_exceeded\""));
        assert!(output.contains("error_type=\"permanent\""));
    }

    #[test]
    fn rotation_gauge_renders() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        set_rotation_requested();
        assert!(handle.render().contains("relay_identity_rotation_requested 1"));
    }
}
