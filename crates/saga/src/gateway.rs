//! The engine's only contact with the outside world.
//!
//! Outbound, commands go through a [`CommandDispatcher`] with transport retry.
//! Inbound, raw messages are correlated to a saga instance before they reach
//! the orchestrator.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::{CorrelationId, Payload};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::definition::DefinitionRegistry;
use crate::error::{Result, SagaError};
use crate::events::{Command, IncomingEvent, is_reserved_event};
use crate::retry::RetryPolicy;

/// Transport-level failure to hand a command to its receiver.
///
/// Business rejections never surface here; they arrive later as failure events.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Command transport unavailable: {0}")]
    Unavailable(String),

    #[error("Command transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode command: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sends commands to external collaborators.
///
/// Implementations must be thread-safe. Receivers are expected to treat a
/// repeated `(correlation_id, command_type)` as a no-op.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Hands one command to the transport.
    async fn dispatch(&self, command: &Command) -> std::result::Result<(), DispatchError>;
}

#[async_trait]
impl<T: CommandDispatcher + ?Sized> CommandDispatcher for Arc<T> {
    async fn dispatch(&self, command: &Command) -> std::result::Result<(), DispatchError> {
        (**self).dispatch(command).await
    }
}

/// Result of dispatching one command under a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The transport accepted the command.
    Delivered { attempts: u32 },
    /// Every attempt failed.
    Exhausted { attempts: u32, last_error: String },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }
}

/// Wraps a dispatcher with exponential backoff.
pub struct Gateway<D> {
    dispatcher: D,
}

impl<D: CommandDispatcher> Gateway<D> {
    pub fn new(dispatcher: D) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Dispatches `command`, retrying transport failures per `policy`.
    #[tracing::instrument(
        skip(self, command, policy),
        fields(
            correlation_id = %command.correlation_id,
            command_type = %command.command_type
        )
    )]
    pub async fn dispatch(&self, command: &Command, policy: &RetryPolicy) -> DispatchOutcome {
        let mut attempt = 1;
        loop {
            match self.dispatcher.dispatch(command).await {
                Ok(()) => {
                    tracing::debug!(attempt, "command dispatched");
                    return DispatchOutcome::Delivered { attempts: attempt };
                }
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for_retry(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "command dispatch failed, retrying"
                    );
                    metrics::counter!("saga_dispatch_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "command dispatch exhausted its retries");
                    return DispatchOutcome::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    };
                }
            }
        }
    }
}

/// A raw event as received from a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Set when the sender knows the saga; derived from the payload otherwise.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub event_type: String,
    #[serde(default)]
    pub payload: Payload,
}

impl InboundMessage {
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: None,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attributes the message to a saga instance.
    ///
    /// An explicit correlation id wins. Otherwise the id is derived from the
    /// correlation key of the one definition that handles the event type.
    /// Triggers of definitions without a correlation key get a fresh id.
    pub fn correlate(self, registry: &DefinitionRegistry) -> Result<IncomingEvent> {
        if is_reserved_event(&self.event_type) {
            return Err(SagaError::Uncorrelated {
                event_type: self.event_type,
                reason: "event type is reserved for the engine".to_string(),
            });
        }

        let correlation_id = match self.correlation_id {
            Some(id) => id,
            None => derive_correlation_id(registry, &self.event_type, &self.payload)?,
        };

        Ok(IncomingEvent {
            correlation_id,
            event_type: self.event_type,
            payload: self.payload,
        })
    }
}

fn derive_correlation_id(
    registry: &DefinitionRegistry,
    event_type: &str,
    payload: &Payload,
) -> Result<CorrelationId> {
    let uncorrelated = |reason: &str| SagaError::Uncorrelated {
        event_type: event_type.to_string(),
        reason: reason.to_string(),
    };

    if let Some(definition) = registry.for_trigger(event_type) {
        return match definition.correlation_key() {
            None => Ok(CorrelationId::generate()),
            Some(_) => definition
                .natural_correlation_id(payload)
                .ok_or_else(|| uncorrelated("payload lacks the correlation key")),
        };
    }

    let candidates: Vec<CorrelationId> = registry
        .definitions_for_event(event_type)
        .into_iter()
        .filter_map(|definition| definition.natural_correlation_id(payload))
        .collect();

    match candidates.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(uncorrelated(
            "no correlation id and no definition can derive one",
        )),
        _ => Err(uncorrelated("event is ambiguous across definitions")),
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    commands: Vec<Command>,
    attempts: usize,
    failures_remaining: usize,
    unavailable: bool,
}

/// A dispatcher that records commands in memory.
///
/// Failures can be injected to exercise transport retry.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDispatcher {
    state: Arc<Mutex<RecorderState>>,
}

impl InMemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `count` dispatch attempts.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures_remaining = count;
    }

    /// Fails every dispatch attempt while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// All delivered commands, in delivery order.
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    /// Delivered command types, in delivery order.
    pub fn command_types(&self) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .map(|c| c.command_type.clone())
            .collect()
    }

    /// Delivered commands for one saga instance.
    pub fn commands_for(&self, correlation_id: &CorrelationId) -> Vec<Command> {
        self.lock()
            .commands
            .iter()
            .filter(|c| &c.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Number of deliveries of `command_type` across all instances.
    pub fn count_of(&self, command_type: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.command_type == command_type)
            .count()
    }

    /// Dispatch attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    pub fn clear(&self) {
        *self.lock() = RecorderState::default();
    }
}

#[async_trait]
impl CommandDispatcher for InMemoryDispatcher {
    async fn dispatch(&self, command: &Command) -> std::result::Result<(), DispatchError> {
        let mut state = self.lock();
        state.attempts += 1;
        if state.unavailable {
            return Err(DispatchError::Unavailable("recorder marked unavailable".into()));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(DispatchError::Unavailable("injected failure".into()));
        }
        state.commands.push(command.clone());
        Ok(())
    }
}
