//! Deployable saga orchestrator.
//!
//! Accepts collaborator events over HTTP, writes commands as JSON lines, and
//! exposes saga inspection endpoints alongside structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod transport;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::sagas::{AppState, SagaOrchestrator};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health))
        .route("/events", post(routes::events::receive))
        .route("/sagas", get(routes::sagas::list))
        .route("/sagas/stats", get(routes::sagas::stats))
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wraps an orchestrator in the state shared by all handlers.
pub fn create_state(orchestrator: Arc<SagaOrchestrator>) -> Arc<AppState> {
    Arc::new(AppState { orchestrator })
}
