//! Saga error types.

use common::{CorrelationId, SagaState};
use instance_store::StoreError;
use thiserror::Error;

/// Errors raised while loading saga definitions.
///
/// Definitions are validated once at startup; none of these can occur while
/// events are being handled.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The definition has no process type name.
    #[error("Saga definition has an empty process type")]
    EmptyProcessType,

    /// The definition declares no trigger event.
    #[error("Saga '{process_type}' declares no trigger event")]
    MissingTrigger { process_type: String },

    /// The definition has no steps.
    #[error("Saga '{process_type}' declares no steps")]
    NoSteps { process_type: String },

    /// Two steps share a name.
    #[error("Saga '{process_type}' declares step '{step}' more than once")]
    DuplicateStep { process_type: String, step: String },

    /// Two steps share a state name.
    #[error("Saga '{process_type}' declares state '{state}' more than once")]
    DuplicateState { process_type: String, state: String },

    /// A step uses a terminal or compensation state name.
    #[error("Saga '{process_type}' uses reserved state name '{state}'")]
    ReservedStateName { process_type: String, state: String },

    /// A step declares no success event.
    #[error("Step '{step}' of saga '{process_type}' declares no success event")]
    MissingSuccessEvent { process_type: String, step: String },

    /// A compensation declares no confirmation event.
    #[error("Compensation of step '{step}' in saga '{process_type}' declares no confirmation event")]
    MissingConfirmation { process_type: String, step: String },

    /// An event type is bound to more than one outcome.
    #[error("Event '{event}' is used more than once in saga '{process_type}'")]
    DuplicateEvent { process_type: String, event: String },

    /// A step binds an event type reserved for synthetic events.
    #[error("Event '{event}' in saga '{process_type}' is reserved by the engine")]
    ReservedEvent { process_type: String, event: String },

    /// A timeout is zero.
    #[error("Timeout of '{step}' in saga '{process_type}' must be positive")]
    NonPositiveTimeout { process_type: String, step: String },

    /// A retry policy cannot make progress.
    #[error("Invalid retry policy in saga '{process_type}': {reason}")]
    InvalidRetryPolicy { process_type: String, reason: String },

    /// A state can never be entered from the initial state.
    #[error("State '{state}' of saga '{process_type}' is unreachable from the initial state")]
    UnreachableState { process_type: String, state: String },

    /// Two definitions share a process type.
    #[error("Saga '{0}' is defined more than once")]
    DuplicateProcessType(String),

    /// Two definitions share a trigger event.
    #[error("Trigger event '{event}' is claimed by both '{first}' and '{second}'")]
    DuplicateTrigger {
        event: String,
        first: String,
        second: String,
    },

    /// The definitions file could not be read.
    #[error("Failed to read saga definitions: {0}")]
    Io(#[from] std::io::Error),

    /// The definitions file is not valid JSON for a definition list.
    #[error("Failed to parse saga definitions: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors that can occur while handling saga events.
#[derive(Debug, Error)]
pub enum SagaError {
    /// An event matched no transition and is not a recognized duplicate.
    #[error("Unexpected event '{event_type}' for saga {correlation_id} in state {state}")]
    UnexpectedEvent {
        correlation_id: CorrelationId,
        state: SagaState,
        event_type: String,
    },

    /// An event arrived for a saga that does not exist and is not a trigger.
    #[error("No saga {correlation_id} exists for event '{event_type}'")]
    UnknownInstance {
        correlation_id: CorrelationId,
        event_type: String,
    },

    /// A stored instance names a process type that is not loaded.
    #[error("Unknown saga process type: {0}")]
    UnknownProcessType(String),

    /// An inbound message could not be attributed to a saga instance.
    #[error("Cannot correlate event '{event_type}': {reason}")]
    Uncorrelated { event_type: String, reason: String },

    /// The engine's inbound channel is closed.
    #[error("Saga engine is not running")]
    EngineStopped,

    /// Definition error.
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Instance store error.
    #[error("Instance store error: {0}")]
    Store(#[from] StoreError),
}

impl SagaError {
    /// Returns true for optimistic-write collisions, which are always retryable.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaError::Store(e) if e.is_conflict())
    }

    /// Returns true for store I/O failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SagaError::Store(StoreError::Database(_)))
    }

    /// Returns true if an operator should look at this error.
    pub fn is_operator_visible(&self) -> bool {
        !matches!(self, SagaError::UnexpectedEvent { .. }) && !self.is_conflict()
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use instance_store::Version;

    #[test]
    fn test_conflict_classification() {
        let conflict = SagaError::Store(StoreError::ConcurrencyConflict {
            correlation_id: CorrelationId::new("C1"),
            expected: Version::first(),
            actual: Version::new(2),
        });
        assert!(conflict.is_conflict());
        assert!(!conflict.is_operator_visible());

        let unexpected = SagaError::UnexpectedEvent {
            correlation_id: CorrelationId::new("C1"),
            state: SagaState::step("AwaitingSlotReservation"),
            event_type: "NotificationsSent".to_string(),
        };
        assert!(!unexpected.is_conflict());
        assert!(!unexpected.is_operator_visible());

        let missing = SagaError::UnknownProcessType("Ghost".to_string());
        assert!(missing.is_operator_visible());
    }

    #[test]
    fn test_store_io_failures_are_transient() {
        let io = SagaError::Store(StoreError::Database(sqlx::Error::PoolTimedOut));
        assert!(io.is_transient());
        assert!(io.is_operator_visible());

        let missing = SagaError::Store(StoreError::NotFound(CorrelationId::new("C1")));
        assert!(!missing.is_transient());
        assert!(!SagaError::EngineStopped.is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = DefinitionError::UnreachableState {
            process_type: "MatchAcceptance".to_string(),
            state: "Compensating:SendNotifications".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "State 'Compensating:SendNotifications' of saga 'MatchAcceptance' is unreachable from the initial state"
        );
    }
}
