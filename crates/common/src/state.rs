//! Saga state machine states.

use serde::{Deserialize, Serialize};

/// Prefix of the synthetic undo-step states entered during compensation.
pub const COMPENSATING_PREFIX: &str = "Compensating:";

/// The state of a saga instance.
///
/// Step states are named by the saga definition. Compensation walks back
/// through synthetic undo-step states, one per compensatable completed step.
///
/// State transitions:
/// ```text
/// Step(first) ──► Step(..) ──► Step(last) ──► Completed
///      │             │
///      └─────────────┴──► Compensating(step) ──► .. ──► Compensated
///                    └──► Failed (nothing to undo)
/// ```
///
/// Persisted as a plain string: step states verbatim, undo states as
/// `Compensating:<Step>`, terminal states by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum SagaState {
    /// Waiting for the response to a forward step's command.
    Step(String),

    /// Waiting for the confirmation of a step's compensating command.
    Compensating(String),

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed and nothing needed undoing (terminal state).
    Failed,

    /// A step failed and every compensatable step was unwound (terminal state).
    Compensated,
}

impl SagaState {
    /// Creates a step state.
    pub fn step(name: impl Into<String>) -> Self {
        SagaState::Step(name.into())
    }

    /// Creates the undo-step state for a forward step.
    pub fn compensating(step_name: impl Into<String>) -> Self {
        SagaState::Compensating(step_name.into())
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::Compensated
        )
    }

    /// Returns true while compensation is in progress.
    pub fn is_compensating(&self) -> bool {
        matches!(self, SagaState::Compensating(_))
    }

    /// Returns true if `name` is reserved for terminal or synthetic states.
    pub fn is_reserved_name(name: &str) -> bool {
        matches!(name, "Completed" | "Failed" | "Compensated")
            || name.starts_with(COMPENSATING_PREFIX)
    }

    /// Returns the persisted name of the state.
    pub fn name(&self) -> String {
        match self {
            SagaState::Step(name) => name.clone(),
            SagaState::Compensating(step) => format!("{COMPENSATING_PREFIX}{step}"),
            SagaState::Completed => "Completed".to_string(),
            SagaState::Failed => "Failed".to_string(),
            SagaState::Compensated => "Compensated".to_string(),
        }
    }

    /// Parses a persisted state name.
    pub fn parse(name: &str) -> Self {
        match name {
            "Completed" => SagaState::Completed,
            "Failed" => SagaState::Failed,
            "Compensated" => SagaState::Compensated,
            other => match other.strip_prefix(COMPENSATING_PREFIX) {
                Some(step) => SagaState::Compensating(step.to_string()),
                None => SagaState::Step(other.to_string()),
            },
        }
    }

    /// Names of all terminal states.
    pub fn terminal_names() -> [&'static str; 3] {
        ["Completed", "Failed", "Compensated"]
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<SagaState> for String {
    fn from(state: SagaState) -> Self {
        state.name()
    }
}

impl From<String> for SagaState {
    fn from(name: String) -> Self {
        SagaState::parse(&name)
    }
}
