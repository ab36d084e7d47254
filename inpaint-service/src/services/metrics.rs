//! Metrics collection and Prometheus export.
//!
//! Installs the global recorder and names the service's own metrics.

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub const REQUESTS_TOTAL: &str = "inpaint_requests_total";
pub const INFERENCE_DURATION: &str = "inpaint_inference_duration_seconds";
pub const ITERATIONS: &str = "inpaint_iterations";
pub const MODEL_LOAD_DURATION: &str = "model_load_duration_seconds";
pub const DB_QUERY_DURATION: &str = "inpaint_db_query_duration_seconds";

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; only the
/// first call installs anything.
///
/// Panics if another recorder was already installed by someone else.
pub fn init_metrics() -> &'static PrometheusHandle {
    METRICS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        describe_counter!(REQUESTS_TOTAL, "Inpainting requests by outcome");
        describe_histogram!(
            INFERENCE_DURATION,
            Unit::Seconds,
            "Wall time of the refinement loop including decode and encode"
        );
        describe_histogram!(ITERATIONS, "Effective refinement rounds per request");
        describe_histogram!(
            MODEL_LOAD_DURATION,
            Unit::Seconds,
            "Time to build the generator and load its weights"
        );
        describe_histogram!(
            DB_QUERY_DURATION,
            Unit::Seconds,
            "Database query duration by operation"
        );

        handle
    })
}

/// Get the current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}
