//! Prometheus metrics handler

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!("sip_active_calls", "Number of active A-leg/B-leg pairings");
    describe_gauge!(
        "sip_registered_aors",
        "Number of addresses-of-record with at least one contact"
    );
    describe_counter!(
        "sip_registrations_total",
        "Total number of REGISTER requests applied"
    );
    describe_counter!("sip_calls_total", "Total number of inbound calls routed");
    describe_counter!(
        "sip_call_forks_failed",
        "Total number of outbound legs that could not be originated"
    );
}

/// HTTP metrics handler
pub async fn metrics_handler(State(prometheus_handle): State<PrometheusHandle>) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}
