//! Saga definitions and their compiled transition tables.
//!
//! A definition is loaded from JSON as a [`DefinitionSpec`], validated, and
//! compiled into a [`SagaDefinition`] whose `(state, event) -> Transition`
//! table is interpreted by the orchestrator. Nothing here changes after
//! startup.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{CorrelationId, Payload, SagaState};
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;
use crate::events::{CANCEL_EVENT, TIMEOUT_EVENT, is_reserved_event};
use crate::retry::RetryPolicy;

/// Prefix of the default state name of a step.
pub const DEFAULT_STATE_PREFIX: &str = "Awaiting";

/// Raw saga definition as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSpec {
    /// Process type name, e.g. `MatchAcceptance`.
    pub process_type: String,
    /// Event type that starts a new instance.
    pub trigger: String,
    /// Payload field holding the natural key of the business trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<StepSpec>,
    /// Transport retry policy for forward commands.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Retry policy for compensating commands; `max_attempts` also bounds how
    /// often a timed-out undo is redispatched.
    #[serde(default)]
    pub compensation_retry: RetryPolicy,
}

impl DefinitionSpec {
    /// Starts a definition for `process_type` triggered by `trigger`.
    pub fn new(process_type: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            process_type: process_type.into(),
            trigger: trigger.into(),
            correlation_key: None,
            steps: Vec::new(),
            retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::default(),
        }
    }

    /// Sets the payload field used to derive correlation ids.
    pub fn correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    /// Appends a step.
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the forward dispatch retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the compensation retry policy.
    pub fn compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = policy;
        self
    }
}

/// Raw step descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// State name while the step is outstanding; `Awaiting<Name>` if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub command: String,
    pub success_events: Vec<String>,
    #[serde(default)]
    pub failure_events: Vec<String>,
    /// Payload fields forwarded with the command; the whole payload if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_keys: Option<Vec<String>>,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSpec>,
}

impl StepSpec {
    /// Starts a step that sends `command`. The timeout defaults to 30 seconds.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: None,
            command: command.into(),
            success_events: Vec::new(),
            failure_events: Vec::new(),
            payload_keys: None,
            timeout_ms: 30_000,
            compensation: None,
        }
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn succeeds_on(mut self, event: impl Into<String>) -> Self {
        self.success_events.push(event.into());
        self
    }

    pub fn fails_on(mut self, event: impl Into<String>) -> Self {
        self.failure_events.push(event.into());
        self
    }

    pub fn forward_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.payload_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = whole_millis(timeout);
        self
    }

    pub fn compensate_with(mut self, compensation: CompensationSpec) -> Self {
        self.compensation = Some(compensation);
        self
    }
}

/// Raw compensation descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSpec {
    pub command: String,
    pub confirmation_events: Vec<String>,
    pub timeout_ms: u64,
}

impl CompensationSpec {
    pub fn new(
        command: impl Into<String>,
        confirmation_event: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            confirmation_events: vec![confirmation_event.into()],
            timeout_ms: whole_millis(timeout),
        }
    }
}

/// A validated step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub state: SagaState,
    pub command: String,
    pub success_events: Vec<String>,
    pub failure_events: Vec<String>,
    pub payload_keys: Option<Vec<String>>,
    pub timeout: Duration,
    pub compensation: Option<CompensationDefinition>,
}

impl StepDefinition {
    /// Returns true if the step declares a compensating command.
    pub fn is_compensatable(&self) -> bool {
        self.compensation.is_some()
    }

    /// Selects the part of the instance payload sent with this step's commands.
    pub fn select_payload(&self, payload: &Payload) -> Payload {
        match &self.payload_keys {
            None => payload.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|key| payload.get(key).map(|value| (key.clone(), value.clone())))
                .collect(),
        }
    }
}

/// A validated compensation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationDefinition {
    pub command: String,
    pub confirmation_events: Vec<String>,
    pub timeout: Duration,
}

/// Why a forward step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The collaborator answered with a failure event.
    Rejected,
    /// The step's deadline elapsed, or its command could not be delivered.
    TimedOut,
    /// An operator cancelled the saga.
    Cancelled,
}

/// An entry of the compiled transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Step `step` succeeded.
    Advance { step: usize },
    /// Step `step` failed; compensation starts.
    Fail { step: usize, kind: FailureKind },
    /// The undo of step `step` was confirmed.
    UndoConfirmed { step: usize },
    /// The undo of step `step` did not confirm in time.
    UndoTimedOut { step: usize },
}

/// What an event type means within one definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBinding {
    /// The step the event reports on.
    pub step: String,
    /// True for undo confirmations.
    pub undo: bool,
}

/// A validated, compiled saga definition.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    process_type: String,
    trigger: String,
    correlation_key: Option<String>,
    steps: Vec<StepDefinition>,
    retry: RetryPolicy,
    compensation_retry: RetryPolicy,
    transitions: HashMap<(String, String), Transition>,
    bindings: HashMap<String, EventBinding>,
}

impl SagaDefinition {
    /// Validates a raw definition and compiles its transition table.
    pub fn compile(spec: DefinitionSpec) -> Result<Self, DefinitionError> {
        let process_type = spec.process_type.trim().to_string();
        if process_type.is_empty() {
            return Err(DefinitionError::EmptyProcessType);
        }
        if spec.trigger.trim().is_empty() {
            return Err(DefinitionError::MissingTrigger { process_type });
        }
        if is_reserved_event(&spec.trigger) {
            return Err(DefinitionError::ReservedEvent {
                process_type,
                event: spec.trigger,
            });
        }
        if spec.steps.is_empty() {
            return Err(DefinitionError::NoSteps { process_type });
        }
        for (policy, name) in [
            (&spec.retry, "retry"),
            (&spec.compensation_retry, "compensation_retry"),
        ] {
            policy
                .validate()
                .map_err(|reason| DefinitionError::InvalidRetryPolicy {
                    process_type: process_type.clone(),
                    reason: format!("{name}: {reason}"),
                })?;
        }

        let mut step_names = HashSet::new();
        let mut state_names = HashSet::new();
        let mut events: HashSet<String> = HashSet::from([spec.trigger.clone()]);
        let mut steps = Vec::with_capacity(spec.steps.len());
        let mut bindings = HashMap::new();

        for raw in spec.steps {
            let step_name = raw.name.trim().to_string();
            if !step_names.insert(step_name.clone()) {
                return Err(DefinitionError::DuplicateStep {
                    process_type,
                    step: step_name,
                });
            }

            let state_name = raw
                .state
                .unwrap_or_else(|| format!("{DEFAULT_STATE_PREFIX}{step_name}"));
            if SagaState::is_reserved_name(&state_name) {
                return Err(DefinitionError::ReservedStateName {
                    process_type,
                    state: state_name,
                });
            }
            if !state_names.insert(state_name.clone()) {
                return Err(DefinitionError::DuplicateState {
                    process_type,
                    state: state_name,
                });
            }

            if raw.success_events.is_empty() {
                return Err(DefinitionError::MissingSuccessEvent {
                    process_type,
                    step: step_name,
                });
            }
            if raw.timeout_ms == 0 {
                return Err(DefinitionError::NonPositiveTimeout {
                    process_type,
                    step: step_name,
                });
            }

            let forward_events = raw.success_events.iter().chain(raw.failure_events.iter());
            for event in forward_events {
                claim_event(&process_type, &mut events, event)?;
                bindings.insert(
                    event.clone(),
                    EventBinding {
                        step: step_name.clone(),
                        undo: false,
                    },
                );
            }

            let compensation = match raw.compensation {
                None => None,
                Some(comp) => {
                    if comp.confirmation_events.is_empty() {
                        return Err(DefinitionError::MissingConfirmation {
                            process_type,
                            step: step_name,
                        });
                    }
                    if comp.timeout_ms == 0 {
                        return Err(DefinitionError::NonPositiveTimeout {
                            process_type,
                            step: format!("{step_name} compensation"),
                        });
                    }
                    for event in &comp.confirmation_events {
                        claim_event(&process_type, &mut events, event)?;
                        bindings.insert(
                            event.clone(),
                            EventBinding {
                                step: step_name.clone(),
                                undo: true,
                            },
                        );
                    }
                    Some(CompensationDefinition {
                        command: comp.command,
                        confirmation_events: comp.confirmation_events,
                        timeout: Duration::from_millis(comp.timeout_ms),
                    })
                }
            };

            steps.push(StepDefinition {
                name: step_name,
                state: SagaState::step(state_name),
                command: raw.command,
                success_events: raw.success_events,
                failure_events: raw.failure_events,
                payload_keys: raw.payload_keys,
                timeout: Duration::from_millis(raw.timeout_ms),
                compensation,
            });
        }

        let mut definition = Self {
            process_type,
            trigger: spec.trigger,
            correlation_key: spec.correlation_key,
            steps,
            retry: spec.retry,
            compensation_retry: spec.compensation_retry,
            transitions: HashMap::new(),
            bindings,
        };
        definition.build_transitions();
        definition.check_reachability()?;
        Ok(definition)
    }

    fn build_transitions(&mut self) {
        let mut table = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            let state = step.state.name();
            for event in &step.success_events {
                table.insert(
                    (state.clone(), event.clone()),
                    Transition::Advance { step: index },
                );
            }
            for event in &step.failure_events {
                table.insert(
                    (state.clone(), event.clone()),
                    Transition::Fail {
                        step: index,
                        kind: FailureKind::Rejected,
                    },
                );
            }
            table.insert(
                (state.clone(), TIMEOUT_EVENT.to_string()),
                Transition::Fail {
                    step: index,
                    kind: FailureKind::TimedOut,
                },
            );
            table.insert(
                (state, CANCEL_EVENT.to_string()),
                Transition::Fail {
                    step: index,
                    kind: FailureKind::Cancelled,
                },
            );

            if let Some(compensation) = &step.compensation {
                let undo_state = SagaState::compensating(&step.name).name();
                for event in &compensation.confirmation_events {
                    table.insert(
                        (undo_state.clone(), event.clone()),
                        Transition::UndoConfirmed { step: index },
                    );
                }
                table.insert(
                    (undo_state, TIMEOUT_EVENT.to_string()),
                    Transition::UndoTimedOut { step: index },
                );
            }
        }
        self.transitions = table;
    }

    /// Walks the table from the initial state; every declared state must be hit.
    fn check_reachability(&self) -> Result<(), DefinitionError> {
        let mut reached: HashSet<SagaState> = HashSet::new();
        let mut queue = VecDeque::from([self.initial_state()]);

        while let Some(state) = queue.pop_front() {
            if !reached.insert(state.clone()) {
                continue;
            }
            for next in self.successors(&state) {
                if !reached.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        let declared = self.steps.iter().flat_map(|step| {
            let undo = step
                .is_compensatable()
                .then(|| SagaState::compensating(&step.name));
            std::iter::once(step.state.clone()).chain(undo)
        });
        for state in declared {
            if !reached.contains(&state) {
                return Err(DefinitionError::UnreachableState {
                    process_type: self.process_type.clone(),
                    state: state.name(),
                });
            }
        }
        Ok(())
    }

    fn successors(&self, state: &SagaState) -> Vec<SagaState> {
        let Some(index) = self.state_step_index(state) else {
            return Vec::new();
        };
        match state {
            SagaState::Step(_) => {
                let forward = self
                    .steps
                    .get(index + 1)
                    .map(|next| next.state.clone())
                    .unwrap_or(SagaState::Completed);
                // While step `index` is outstanding, steps 0..index have completed.
                let failure = self.undo_state_before(index);
                vec![forward, failure]
            }
            SagaState::Compensating(_) => vec![self.undo_state_before(index)],
            _ => Vec::new(),
        }
    }

    fn undo_state_before(&self, index: usize) -> SagaState {
        self.steps[..index]
            .iter()
            .rev()
            .find(|step| step.is_compensatable())
            .map(|step| SagaState::compensating(&step.name))
            .unwrap_or(SagaState::Failed)
    }

    fn state_step_index(&self, state: &SagaState) -> Option<usize> {
        match state {
            SagaState::Step(_) => self.steps.iter().position(|s| &s.state == state),
            SagaState::Compensating(name) => self.steps.iter().position(|s| &s.name == name),
            _ => None,
        }
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn correlation_key(&self) -> Option<&str> {
        self.correlation_key.as_deref()
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn step_by_name(&self, name: &str) -> Option<(usize, &StepDefinition)> {
        self.steps.iter().enumerate().find(|(_, s)| s.name == name)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn compensation_retry(&self) -> &RetryPolicy {
        &self.compensation_retry
    }

    /// The state a new instance starts in.
    pub fn initial_state(&self) -> SagaState {
        self.steps[0].state.clone()
    }

    /// Looks up the transition for `event_type` in `state`.
    pub fn transition(&self, state: &SagaState, event_type: &str) -> Option<Transition> {
        self.transitions
            .get(&(state.name(), event_type.to_string()))
            .copied()
    }

    /// The step and direction an event type reports on, if it is bound at all.
    pub fn binding(&self, event_type: &str) -> Option<&EventBinding> {
        self.bindings.get(event_type)
    }

    /// Returns true if this definition reacts to `event_type` in any way.
    pub fn handles_event(&self, event_type: &str) -> bool {
        event_type == self.trigger || self.bindings.contains_key(event_type)
    }

    /// Returns true if `state` belongs to this definition.
    pub fn declares_state(&self, state: &SagaState) -> bool {
        state.is_terminal() || self.state_step_index(state).is_some()
    }

    /// Builds `<ProcessType>:<payload[correlation_key]>`, if possible.
    pub fn natural_correlation_id(&self, payload: &Payload) -> Option<CorrelationId> {
        let key = self.correlation_key.as_deref()?;
        let value = payload.get(key)?;
        let natural = match value {
            serde_json::Value::String(s) if !s.is_empty() => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(CorrelationId::for_natural_key(&self.process_type, &natural))
    }
}

fn claim_event(
    process_type: &str,
    events: &mut HashSet<String>,
    event: &str,
) -> Result<(), DefinitionError> {
    if is_reserved_event(event) {
        return Err(DefinitionError::ReservedEvent {
            process_type: process_type.to_string(),
            event: event.to_string(),
        });
    }
    if !events.insert(event.to_string()) {
        return Err(DefinitionError::DuplicateEvent {
            process_type: process_type.to_string(),
            event: event.to_string(),
        });
    }
    Ok(())
}

/// All loaded saga definitions, indexed by process type and trigger event.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    by_process_type: HashMap<String, Arc<SagaDefinition>>,
    by_trigger: HashMap<String, String>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and registers every definition in `specs`.
    pub fn from_specs(specs: Vec<DefinitionSpec>) -> Result<Self, DefinitionError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(SagaDefinition::compile(spec)?)?;
        }
        Ok(registry)
    }

    /// Parses a JSON array of definitions.
    pub fn from_json_str(json: &str) -> Result<Self, DefinitionError> {
        let specs: Vec<DefinitionSpec> = serde_json::from_str(json)?;
        Self::from_specs(specs)
    }

    /// Reads a JSON array of definitions from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Adds a compiled definition.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<(), DefinitionError> {
        let process_type = definition.process_type().to_string();
        if self.by_process_type.contains_key(&process_type) {
            return Err(DefinitionError::DuplicateProcessType(process_type));
        }
        if let Some(first) = self.by_trigger.get(definition.trigger()) {
            return Err(DefinitionError::DuplicateTrigger {
                event: definition.trigger().to_string(),
                first: first.clone(),
                second: process_type,
            });
        }

        tracing::debug!(
            process_type = %process_type,
            trigger = definition.trigger(),
            steps = definition.steps().len(),
            "saga definition registered"
        );
        self.by_trigger
            .insert(definition.trigger().to_string(), process_type.clone());
        self.by_process_type
            .insert(process_type, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, process_type: &str) -> Option<&Arc<SagaDefinition>> {
        self.by_process_type.get(process_type)
    }

    /// The definition started by `event_type`, if any.
    pub fn for_trigger(&self, event_type: &str) -> Option<&Arc<SagaDefinition>> {
        self.by_trigger
            .get(event_type)
            .and_then(|process_type| self.by_process_type.get(process_type))
    }

    /// Every definition that reacts to `event_type`.
    pub fn definitions_for_event(&self, event_type: &str) -> Vec<&Arc<SagaDefinition>> {
        self.by_process_type
            .values()
            .filter(|definition| definition.handles_event(event_type))
            .collect()
    }

    pub fn process_types(&self) -> impl Iterator<Item = &str> {
        self.by_process_type.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_process_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_process_type.is_empty()
    }
}

/// Milliseconds in `duration`, rounding a non-zero sub-millisecond remainder up.
fn whole_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration.subsec_nanos() % 1_000_000 != 0 {
        millis.saturating_add(1)
    } else {
        millis
    }
}
