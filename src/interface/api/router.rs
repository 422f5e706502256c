//! API Router configuration

use super::admin_handler::{health_check, list_accounts, list_calls, list_registrations};
use super::metrics_handler::metrics_handler;
use crate::application::AdminView;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the admin API router
pub fn build_router(view: AdminView, prometheus_handle: PrometheusHandle) -> Router {
    let admin_routes = Router::new()
        .route("/health", get(health_check))
        .route("/accounts", get(list_accounts))
        .route("/calls", get(list_calls))
        .route("/registrations", get(list_registrations))
        .with_state(view);

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(admin_routes)
        .merge(metrics_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
