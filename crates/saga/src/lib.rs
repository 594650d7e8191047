//! Saga orchestration engine.
//!
//! Drives long-running, multi-step business processes across independent
//! services. Each process either completes every step or is unwound through
//! compensating commands, most recent step first.
//!
//! A saga is described by a [`DefinitionSpec`] (usually loaded from JSON),
//! compiled into a transition table, and interpreted by the [`Orchestrator`]:
//!
//! 1. an event is correlated to an instance (or creates one, idempotently);
//! 2. the `(state, event)` pair selects a [`Transition`];
//! 3. the new state is persisted under optimistic concurrency;
//! 4. only then are commands dispatched and the next deadline armed.
//!
//! Timeouts and administrative cancellation are synthetic events handled by
//! the same path as business failures.

pub mod compensation;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod match_acceptance;
pub mod orchestrator;
pub mod retry;
pub mod timeout;

pub use compensation::{CompensationExecutor, CompensationPlan};
pub use definition::{
    CompensationDefinition, CompensationSpec, DefinitionRegistry, DefinitionSpec, EventBinding,
    FailureKind, SagaDefinition, StepDefinition, StepSpec, Transition,
};
pub use engine::{EngineHandle, SagaEngine};
pub use error::{DefinitionError, Result, SagaError};
pub use events::{CANCEL_EVENT, Command, IncomingEvent, TIMEOUT_EVENT};
pub use gateway::{
    CommandDispatcher, DispatchError, DispatchOutcome, Gateway, InMemoryDispatcher,
    InboundMessage,
};
pub use orchestrator::{DiscardReason, EventOutcome, Orchestrator, OrchestratorConfig};
pub use retry::RetryPolicy;
pub use timeout::TimeoutManager;

pub use common::{CorrelationId, Payload, SagaState};
pub use instance_store::{SagaInstance, Version};
