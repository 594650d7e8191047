//! HTTP-callback inbound transport.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::CorrelationId;
use saga::{EventOutcome, InboundMessage};
use serde::Serialize;

use crate::error::ApiError;
use crate::routes::sagas::AppState;

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub correlation_id: CorrelationId,
    pub result: EventOutcome,
}

/// POST /events: correlate a collaborator's event and apply it.
///
/// The response is sent after the transition is persisted and its command
/// dispatched, so a 2xx means the event will not be lost.
#[tracing::instrument(skip(state, message), fields(event_type = %message.event_type))]
pub async fn receive(
    State(state): State<Arc<AppState>>,
    Json(message): Json<InboundMessage>,
) -> Result<Json<EventResponse>, ApiError> {
    if message.event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("event_type must not be empty".to_string()));
    }

    let event = message.correlate(state.orchestrator.registry())?;
    let correlation_id = event.correlation_id.clone();
    let result = state.orchestrator.handle_event(event).await?;

    Ok(Json(EventResponse {
        correlation_id,
        result,
    }))
}
