//! Liveness and Prometheus endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::routes::sagas::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub process_types: Vec<String>,
}

/// GET /health: liveness plus the saga definitions this instance runs.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut process_types: Vec<String> = state
        .orchestrator
        .registry()
        .process_types()
        .map(str::to_string)
        .collect();
    process_types.sort();

    Json(HealthResponse {
        status: "ok",
        process_types,
    })
}

/// GET /metrics: saga counters and latencies in Prometheus text format.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
