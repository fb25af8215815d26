use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::JobQueue;

/// State for the scrape endpoint.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<dyn JobQueue>,
}

/// GET /metrics: Prometheus text exposition.
/// Queue depth is sampled at scrape time so the gauge never goes stale.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.queue.depth().await {
        Ok(depth) => metrics::gauge!("analysis_queue_depth").set(depth as f64),
        Err(e) => tracing::warn!(error = %e, "Queue depth unavailable at scrape"),
    }
    state.handle.render()
}
