//! Saga inspection and administration endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use common::{CorrelationId, SagaState};
use instance_store::{InstanceQuery, InstanceStore, SagaInstance, StateCount};
use saga::{CommandDispatcher, Orchestrator};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::events::EventResponse;

/// The orchestrator as wired by the server: store and transport chosen at startup.
pub type SagaOrchestrator = Orchestrator<Arc<dyn InstanceStore>, Arc<dyn CommandDispatcher>>;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: Arc<SagaOrchestrator>,
}

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub process_type: Option<String>,
    pub state: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub process_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub process_type: String,
    pub total: i64,
    pub states: Vec<StateCount>,
}

/// GET /sagas/:id: load one saga instance.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaInstance>, ApiError> {
    let correlation_id = CorrelationId::new(id);
    let instance = state
        .orchestrator
        .get(&correlation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {correlation_id} not found")))?;
    Ok(Json(instance))
}

/// GET /sagas: list instances, optionally filtered by process type and state.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<SagaInstance>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }

    let mut query = InstanceQuery::new().limit(limit);
    if let Some(process_type) = params.process_type {
        query = query.process_type(process_type);
    }
    if let Some(name) = params.state.filter(|s| !s.is_empty()) {
        query = query.state(SagaState::parse(&name));
    }
    if let Some(offset) = params.offset {
        query = query.offset(offset);
    }

    Ok(Json(state.orchestrator.list(query).await?))
}

/// GET /sagas/stats: instance counts per state for one process type.
#[tracing::instrument(skip(state))]
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let states = state.orchestrator.stats(&params.process_type).await?;
    let total = states.iter().map(|s| s.count).sum();
    Ok(Json(StatsResponse {
        process_type: params.process_type,
        total,
        states,
    }))
}

/// POST /sagas/:id/cancel: unwind a running saga.
#[tracing::instrument(skip(state, req))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    req: Option<Json<CancelRequest>>,
) -> Result<Json<EventResponse>, ApiError> {
    let correlation_id = CorrelationId::new(id);
    let reason = req
        .and_then(|Json(r)| r.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "cancelled by operator".to_string());

    let result = state
        .orchestrator
        .cancel(correlation_id.clone(), reason)
        .await?;
    Ok(Json(EventResponse {
        correlation_id,
        result,
    }))
}
