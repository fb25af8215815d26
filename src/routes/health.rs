use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize, Deserialize)]
pub struct HealthChecks {
    pub registry: ComponentHealth,
    pub queue: ComponentHealth,
}

#[derive(Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(start: Instant) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: Health check with dependency status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let registry_start = Instant::now();
    let registry = match state.registry.health_check().await {
        Ok(()) => ComponentHealth::ok(registry_start),
        Err(e) => {
            tracing::warn!(error = %e, "Registry health check failed");
            ComponentHealth::error()
        }
    };

    let queue_start = Instant::now();
    let queue = match state.queue.health_check().await {
        Ok(()) => ComponentHealth::ok(queue_start),
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            ComponentHealth::error()
        }
    };

    let all_healthy = registry.is_ok() && queue.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { registry, queue },
    };

    (status_code, Json(response))
}
