use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, Payload, SagaState};

/// Version number of a saga instance, used for optimistic concurrency control.
///
/// A new instance is stored at version 1 and every persisted transition
/// increments the version by exactly one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0), meaning "not stored yet".
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version (1) of a freshly created instance.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// The persisted record of one running saga.
///
/// Only the orchestrator mutates instances; the store merely guarantees that a
/// write lands on the version it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Routing key for every event and command of this saga.
    pub correlation_id: CorrelationId,

    /// Which saga definition governs this instance.
    pub process_type: String,

    /// Current step, undo-step, or terminal state.
    pub current_state: SagaState,

    /// Data accumulated from the trigger and from step responses.
    pub payload: Payload,

    /// Steps that finished successfully, in completion order.
    pub completed_steps: Vec<String>,

    /// Steps whose compensation has been confirmed.
    pub compensated_steps: Vec<String>,

    /// Steps whose compensation exhausted its retries.
    pub abandoned_compensations: Vec<String>,

    /// What triggered compensation, if anything did.
    pub failure_reason: Option<String>,

    /// Dispatch attempts made for the current state.
    pub attempt: u32,

    /// Optimistic concurrency version.
    pub version: Version,

    /// Deadline of the outstanding step, if one is armed.
    pub deadline_at: Option<DateTime<Utc>>,

    /// When the instance was created.
    pub created_at: DateTime<Utc>,

    /// When the instance was last written.
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    /// Creates an instance at version 1 in the given initial state.
    pub fn new(
        correlation_id: CorrelationId,
        process_type: impl Into<String>,
        initial_state: SagaState,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            process_type: process_type.into(),
            current_state: initial_state,
            payload,
            completed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            abandoned_compensations: Vec::new(),
            failure_reason: None,
            attempt: 1,
            version: Version::first(),
            deadline_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the instance can no longer transition.
    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Returns true if `step` has finished successfully.
    pub fn has_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Returns true if `step` needs no further compensation work.
    pub fn is_unwound(&self, step: &str) -> bool {
        self.compensated_steps.iter().any(|s| s == step)
            || self.abandoned_compensations.iter().any(|s| s == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_sequence() {
        assert_eq!(Version::initial().next(), Version::first());
        assert_eq!(Version::first().next(), Version::new(2));
        assert!(Version::new(3) > Version::new(2));
    }

    #[test]
    fn test_new_instance_defaults() {
        let now = Utc::now();
        let instance = SagaInstance::new(
            CorrelationId::new("C1"),
            "MatchAcceptance",
            SagaState::step("AwaitingSlotReservation"),
            Payload::new(),
            now,
        );

        assert_eq!(instance.version, Version::first());
        assert_eq!(instance.attempt, 1);
        assert!(instance.completed_steps.is_empty());
        assert!(instance.deadline_at.is_none());
        assert!(!instance.is_terminal());
        assert_eq!(instance.created_at, instance.updated_at);
    }

    #[test]
    fn test_step_bookkeeping() {
        let mut instance = SagaInstance::new(
            CorrelationId::new("C1"),
            "MatchAcceptance",
            SagaState::Completed,
            Payload::new(),
            Utc::now(),
        );
        instance.completed_steps.push("ReserveSlot".to_string());
        instance.abandoned_compensations.push("ReserveSlot".to_string());

        assert!(instance.is_terminal());
        assert!(instance.has_completed("ReserveSlot"));
        assert!(!instance.has_completed("SendNotifications"));
        assert!(instance.is_unwound("ReserveSlot"));
    }
}
