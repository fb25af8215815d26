use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::routes;
use crate::routes::metrics::MetricsState;

/// Build the HTTP API. `/metrics` is mounted only when a Prometheus handle is given.
pub fn build_router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let body_limit = state
        .max_upload_bytes
        .saturating_mul(routes::jobs::MAX_FILES_PER_REQUEST);

    let queue = state.queue.clone();

    let mut app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/upload", post(routes::jobs::upload))
        .route("/api/status/{job_id}", get(routes::jobs::get_job_status))
        .route("/api/result/{job_id}", get(routes::jobs::get_job_result))
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(MetricsState { handle, queue }),
        );
    }

    app.layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
