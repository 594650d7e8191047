//! Events entering the orchestrator and commands leaving it.

use common::{CorrelationId, Payload, SagaState};
use instance_store::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synthetic event emitted when a step's deadline elapses.
pub const TIMEOUT_EVENT: &str = "TimeoutEvent";

/// Synthetic event emitted when a saga is cancelled administratively.
pub const CANCEL_EVENT: &str = "CancellationRequested";

const TIMED_OUT_STATE: &str = "timed_out_state";
const ARMED_VERSION: &str = "armed_version";
const CANCEL_REASON: &str = "reason";

/// An event correlated to one saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    /// The saga instance this event belongs to.
    pub correlation_id: CorrelationId,
    /// The event type, matched against the transition table.
    pub event_type: String,
    /// Business data carried by the event.
    #[serde(default)]
    pub payload: Payload,
}

impl IncomingEvent {
    /// Creates an event with an empty payload.
    pub fn new(correlation_id: impl Into<CorrelationId>, event_type: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            payload: Payload::new(),
        }
    }

    /// Replaces the payload with the fields of a JSON object.
    ///
    /// Non-object values leave the payload empty.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        self
    }

    /// Creates the timeout event for a deadline armed in `state` at `version`.
    pub fn timeout(correlation_id: CorrelationId, state: &SagaState, version: Version) -> Self {
        let mut payload = Payload::new();
        payload.insert(TIMED_OUT_STATE.to_string(), Value::from(state.name()));
        payload.insert(ARMED_VERSION.to_string(), Value::from(version.as_i64()));
        Self {
            correlation_id,
            event_type: TIMEOUT_EVENT.to_string(),
            payload,
        }
    }

    /// Creates an administrative cancellation event.
    pub fn cancellation(correlation_id: CorrelationId, reason: impl Into<String>) -> Self {
        let mut payload = Payload::new();
        payload.insert(CANCEL_REASON.to_string(), Value::from(reason.into()));
        Self {
            correlation_id,
            event_type: CANCEL_EVENT.to_string(),
            payload,
        }
    }

    /// Returns true for events synthesized by the engine itself.
    pub fn is_synthetic(&self) -> bool {
        is_reserved_event(&self.event_type)
    }

    /// For timeout events, the state and version the deadline was armed for.
    pub fn timeout_target(&self) -> Option<(SagaState, Version)> {
        if self.event_type != TIMEOUT_EVENT {
            return None;
        }
        let state = self.payload.get(TIMED_OUT_STATE)?.as_str()?;
        let version = self.payload.get(ARMED_VERSION)?.as_i64()?;
        Some((SagaState::parse(state), Version::new(version)))
    }

    /// For cancellation events, the reason given by the operator.
    pub fn cancel_reason(&self) -> Option<&str> {
        if self.event_type != CANCEL_EVENT {
            return None;
        }
        self.payload.get(CANCEL_REASON).and_then(Value::as_str)
    }
}

/// Returns true if `event_type` is reserved for synthetic events.
pub fn is_reserved_event(event_type: &str) -> bool {
    event_type == TIMEOUT_EVENT || event_type == CANCEL_EVENT
}

/// A command dispatched to an external collaborator.
///
/// Receivers must treat a repeated `(correlation_id, command_type)` as a no-op:
/// the engine redispatches after crashes, timeouts and transport failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// The saga instance issuing the command.
    pub correlation_id: CorrelationId,
    /// The command type understood by the collaborator.
    pub command_type: String,
    /// The step this command performs or undoes.
    pub step: String,
    /// The instance version whose transition produced this command.
    pub version: Version,
    /// Data drawn from the instance payload.
    pub payload: Payload,
}
