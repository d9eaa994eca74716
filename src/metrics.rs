//! Prometheus metrics for resource bring-up and shutdown.
//!
//! Library code records through the `metrics` facade; nothing is exported
//! unless a binary installs a recorder with [`init_metrics`].

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Resources that came up (counter). Labels: family.
pub const BRINGUP_SUCCESS_TOTAL: &str = "resource_hub_bringup_success_total";

/// Resources that failed to come up (counter). Labels: family.
pub const BRINGUP_FAILURES_TOTAL: &str = "resource_hub_bringup_failures_total";

/// Time spent connecting one resource, in seconds (histogram). Labels: family.
pub const BRINGUP_DURATION_SECONDS: &str = "resource_hub_bringup_duration_seconds";

/// Resources closed cleanly (counter). Labels: family.
pub const CLOSED_TOTAL: &str = "resource_hub_closed_total";

/// Resources whose close failed (counter). Labels: family.
pub const CLOSE_FAILURES_TOTAL: &str = "resource_hub_close_failures_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent; a second
/// call returns the handle installed by the first.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(BRINGUP_SUCCESS_TOTAL, "Resources connected during bring-up");
    describe_counter!(
        BRINGUP_FAILURES_TOTAL,
        "Resources that failed to connect during bring-up"
    );
    describe_histogram!(
        BRINGUP_DURATION_SECONDS,
        "Per-resource connect duration in seconds"
    );
    describe_counter!(CLOSED_TOTAL, "Resources closed cleanly");
    describe_counter!(CLOSE_FAILURES_TOTAL, "Resources whose close failed");
}

/// Render the current metrics in Prometheus exposition format, if a
/// recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_share_prefix() {
        for name in [
            BRINGUP_SUCCESS_TOTAL,
            BRINGUP_FAILURES_TOTAL,
            BRINGUP_DURATION_SECONDS,
            CLOSED_TOTAL,
            CLOSE_FAILURES_TOTAL,
        ] {
            assert!(name.starts_with("resource_hub_"), "{name}");
        }
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics().unwrap() as *const PrometheusHandle;
        let second = init_metrics().unwrap() as *const PrometheusHandle;
        assert_eq!(first, second);
        describe_metrics();
        assert!(render().is_some());
    }
}
