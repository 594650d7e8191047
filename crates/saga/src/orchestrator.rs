//! The orchestrator core: one generic interpreter for every saga definition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use common::{CorrelationId, SagaState, merge_payload};
use instance_store::{
    InsertOutcome, InstanceQuery, InstanceStore, SagaInstance, StateCount, Version,
};
use serde::Serialize;

use crate::compensation::{CompensationExecutor, CompensationPlan};
use crate::definition::{
    DefinitionRegistry, FailureKind, SagaDefinition, StepDefinition, Transition,
};
use crate::error::{Result, SagaError};
use crate::events::{CANCEL_EVENT, Command, IncomingEvent, TIMEOUT_EVENT};
use crate::gateway::{CommandDispatcher, DispatchOutcome, Gateway};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutManager;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often an event is re-evaluated after losing a version race.
    pub max_conflict_retries: u32,
    /// Backoff for store I/O failures while handling an event.
    pub store_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            store_retry: RetryPolicy::default(),
        }
    }
}

/// Why an event was accepted without changing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DiscardReason {
    /// The trigger was already handled for this correlation id.
    DuplicateTrigger,
    /// The instance already finished.
    Terminal { state: SagaState },
    /// The event reports on a step that was already processed.
    Duplicate { step: String },
    /// The deadline was armed for an earlier state or version.
    StaleTimeout,
    /// The instance is already unwinding.
    AlreadyCompensating,
}

/// The result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    /// A new instance was created.
    Started {
        correlation_id: CorrelationId,
        state: SagaState,
    },
    /// The instance moved to a new state (or re-entered its state).
    Transitioned {
        from: SagaState,
        to: SagaState,
        version: Version,
    },
    /// The event was logged and dropped.
    Discarded(DiscardReason),
}

impl EventOutcome {
    pub fn is_discarded(&self) -> bool {
        matches!(self, EventOutcome::Discarded(_))
    }
}

/// A persisted transition waiting for its side effects.
struct Committed {
    instance: SagaInstance,
    command: Option<Command>,
    policy: RetryPolicy,
}

/// Drives saga instances through their definitions.
///
/// Every transition is persisted with a version check before any command
/// leaves the process. Concurrent events for one instance are serialized by
/// that check alone: the loser re-reads and re-evaluates.
pub struct Orchestrator<S, D> {
    store: S,
    registry: Arc<DefinitionRegistry>,
    gateway: Gateway<D>,
    timeouts: TimeoutManager,
    config: OrchestratorConfig,
}

impl<S, D> Orchestrator<S, D>
where
    S: InstanceStore,
    D: CommandDispatcher,
{
    pub fn new(
        store: S,
        registry: Arc<DefinitionRegistry>,
        dispatcher: D,
        timeouts: TimeoutManager,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            gateway: Gateway::new(dispatcher),
            timeouts,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &D {
        self.gateway.dispatcher()
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    /// Handles one correlated event, including any timeouts it escalates to.
    ///
    /// Returns the outcome for `event` itself.
    #[tracing::instrument(
        skip(self, event),
        fields(correlation_id = %event.correlation_id, event_type = %event.event_type)
    )]
    pub async fn handle_event(&self, event: IncomingEvent) -> Result<EventOutcome> {
        let started = Instant::now();
        metrics::counter!("saga_events_total").increment(1);

        let (outcome, escalation) = match self.process_with_retry(&event).await {
            Ok(processed) => processed,
            Err(e) => {
                self.rearm_failed_timeout(&event, &e);
                return Err(e);
            }
        };

        let mut queue: VecDeque<IncomingEvent> = escalation.into_iter().collect();
        while let Some(follow_up) = queue.pop_front() {
            // The armed deadline still covers the instance if this fails.
            match self.process_with_retry(&follow_up).await {
                Ok((_, next)) => queue.extend(next),
                Err(e) => {
                    tracing::error!(error = %e, "escalated timeout could not be handled");
                    self.rearm_failed_timeout(&follow_up, &e);
                }
            }
        }

        metrics::histogram!("saga_event_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Requests cancellation; the saga unwinds like after a failure.
    pub async fn cancel(
        &self,
        correlation_id: CorrelationId,
        reason: impl Into<String>,
    ) -> Result<EventOutcome> {
        let reason = reason.into();
        tracing::info!(correlation_id = %correlation_id, reason = %reason, "cancellation requested");
        self.handle_event(IncomingEvent::cancellation(correlation_id, reason))
            .await
    }

    pub async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>> {
        Ok(self.store.get(correlation_id).await?)
    }

    pub async fn list(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        Ok(self.store.query(query).await?)
    }

    /// Instance counts per state for one process type.
    pub async fn stats(&self, process_type: &str) -> Result<Vec<StateCount>> {
        if self.registry.get(process_type).is_none() {
            return Err(SagaError::UnknownProcessType(process_type.to_string()));
        }
        Ok(self.store.count_by_state(process_type).await?)
    }

    /// Re-arms the deadlines of all running instances after a restart.
    ///
    /// Deadlines that passed while the engine was down fire immediately.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.store.find_pending_deadlines().await?;
        let now = Utc::now();
        let mut overdue = 0;

        for instance in &pending {
            if let Some(deadline) = instance.deadline_at {
                if deadline <= now {
                    overdue += 1;
                }
                self.timeouts.arm_until(
                    instance.correlation_id.clone(),
                    instance.current_state.clone(),
                    instance.version,
                    deadline,
                );
            }
        }

        tracing::info!(rearmed = pending.len(), overdue, "saga deadlines recovered");
        Ok(pending.len())
    }

    /// Re-evaluates after lost version races and backs off on store I/O failures.
    async fn process_with_retry(
        &self,
        event: &IncomingEvent,
    ) -> Result<(EventOutcome, Option<IncomingEvent>)> {
        let policy = &self.config.store_retry;
        let mut conflicts = 0;
        let mut attempt = 1;
        loop {
            match self.process(event).await {
                Err(e) if e.is_conflict() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    metrics::counter!("saga_concurrency_conflicts_total").increment(1);
                    tracing::debug!(conflicts, "lost version race, re-evaluating");
                }
                Err(e) if e.is_conflict() => {
                    metrics::counter!("saga_concurrency_conflicts_total").increment(1);
                    tracing::warn!(conflicts, "conflict retries exhausted");
                    return Err(e);
                }
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_retry(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "instance store unavailable, retrying"
                    );
                    metrics::counter!("saga_store_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(attempt, error = %e, "instance store retries exhausted");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Puts a deadline back after its timeout event could not be applied.
    ///
    /// The fired timer already left the map, so without this the instance
    /// would wait forever.
    fn rearm_failed_timeout(&self, event: &IncomingEvent, error: &SagaError) {
        if !(error.is_transient() || error.is_conflict()) {
            return;
        }
        let Some((state, version)) = event.timeout_target() else {
            return;
        };
        let delay = self.config.store_retry.base_delay(self.config.store_retry.max_attempts);
        if self
            .timeouts
            .arm(event.correlation_id.clone(), state, version, delay)
        {
            tracing::warn!(
                correlation_id = %event.correlation_id,
                version = %version,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "timeout not applied, deadline re-armed"
            );
        }
    }

    async fn process(&self, event: &IncomingEvent) -> Result<(EventOutcome, Option<IncomingEvent>)> {
        let Some(current) = self.store.get(&event.correlation_id).await? else {
            return match self.registry.for_trigger(&event.event_type) {
                Some(definition) => self.start(Arc::clone(definition), event).await,
                None => Err(SagaError::UnknownInstance {
                    correlation_id: event.correlation_id.clone(),
                    event_type: event.event_type.clone(),
                }),
            };
        };

        let definition = self
            .registry
            .get(&current.process_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownProcessType(current.process_type.clone()))?;

        if event.event_type == definition.trigger() {
            return Ok((self.discard(&current, DiscardReason::DuplicateTrigger), None));
        }
        if current.is_terminal() {
            let reason = DiscardReason::Terminal {
                state: current.current_state.clone(),
            };
            return Ok((self.discard(&current, reason), None));
        }
        if event.event_type == TIMEOUT_EVENT
            && event.timeout_target() != Some((current.current_state.clone(), current.version))
        {
            return Ok((self.discard(&current, DiscardReason::StaleTimeout), None));
        }

        let Some(transition) = definition.transition(&current.current_state, &event.event_type)
        else {
            return self.unmatched(&definition, &current, event).map(|o| (o, None));
        };

        let committed = self
            .apply(&definition, &current, event, transition)
            .await?;
        let outcome = EventOutcome::Transitioned {
            from: current.current_state.clone(),
            to: committed.instance.current_state.clone(),
            version: committed.instance.version,
        };
        let escalation = self.after_commit(committed).await;
        Ok((outcome, escalation))
    }

    async fn start(
        &self,
        definition: Arc<SagaDefinition>,
        event: &IncomingEvent,
    ) -> Result<(EventOutcome, Option<IncomingEvent>)> {
        let now = Utc::now();
        let mut instance = SagaInstance::new(
            event.correlation_id.clone(),
            definition.process_type(),
            definition.initial_state(),
            event.payload.clone(),
            now,
        );
        let command = enter_step(&mut instance, &definition.steps()[0], now);

        if self.store.insert_if_absent(&instance).await? == InsertOutcome::AlreadyExists {
            metrics::counter!("saga_discarded_events_total").increment(1);
            tracing::info!("trigger already handled, discarding");
            return Ok((EventOutcome::Discarded(DiscardReason::DuplicateTrigger), None));
        }

        metrics::counter!("saga_started_total", "process_type" => definition.process_type().to_string())
            .increment(1);
        tracing::info!(
            process_type = definition.process_type(),
            state = %instance.current_state,
            "saga started"
        );

        let outcome = EventOutcome::Started {
            correlation_id: instance.correlation_id.clone(),
            state: instance.current_state.clone(),
        };
        let escalation = self
            .after_commit(Committed {
                instance,
                command: Some(command),
                policy: *definition.retry_policy(),
            })
            .await;
        Ok((outcome, escalation))
    }

    /// Computes and persists the instance that results from `transition`.
    async fn apply(
        &self,
        definition: &SagaDefinition,
        current: &SagaInstance,
        event: &IncomingEvent,
        transition: Transition,
    ) -> Result<Committed> {
        let now = Utc::now();
        let mut next = current.clone();
        next.version = current.version.next();
        next.updated_at = now;
        if !event.is_synthetic() {
            merge_payload(&mut next.payload, &event.payload);
        }

        let executor = CompensationExecutor::new(definition);
        let command = match transition {
            Transition::Advance { step } => {
                next.completed_steps.push(definition.steps()[step].name.clone());
                match definition.step(step + 1) {
                    Some(following) => Some(enter_step(&mut next, following, now)),
                    None => settle(&mut next, SagaState::Completed),
                }
            }
            Transition::Fail { step, kind } => {
                let failed = &definition.steps()[step];
                let reason = describe_failure(failed, kind, event);
                tracing::warn!(step = %failed.name, reason = %reason, "saga step failed");
                next.failure_reason = Some(reason);
                next_undo(&executor, &mut next, now)
            }
            Transition::UndoConfirmed { step } => {
                let undone = definition.steps()[step].name.clone();
                next.compensated_steps.push(undone);
                next_undo(&executor, &mut next, now)
            }
            Transition::UndoTimedOut { step } => {
                let undone = &definition.steps()[step];
                if executor.may_redispatch(&next) {
                    let attempt = next.attempt + 1;
                    tracing::warn!(step = %undone.name, attempt, "compensation timed out, redispatching");
                    let command = enter_undo(&mut next, undone, now);
                    next.attempt = attempt;
                    command
                } else {
                    tracing::error!(
                        step = %undone.name,
                        attempts = next.attempt,
                        "compensation abandoned after exhausting its retries"
                    );
                    metrics::counter!("saga_compensations_abandoned_total").increment(1);
                    next.abandoned_compensations.push(undone.name.clone());
                    next_undo(&executor, &mut next, now)
                }
            }
        };

        self.store.update(&next, current.version).await?;

        let policy = if next.current_state.is_compensating() {
            *definition.compensation_retry()
        } else {
            *definition.retry_policy()
        };
        Ok(Committed {
            instance: next,
            command,
            policy,
        })
    }

    /// Side effects of a persisted transition: cancel, dispatch, re-arm.
    ///
    /// Returns a timeout event to process immediately if dispatch was exhausted.
    async fn after_commit(&self, committed: Committed) -> Option<IncomingEvent> {
        let Committed {
            instance,
            command,
            policy,
        } = committed;

        self.timeouts.cancel(&instance.correlation_id, instance.version);
        if instance.is_terminal() {
            record_terminal(&instance);
            return None;
        }

        let mut escalation = None;
        if let Some(command) = command {
            if let DispatchOutcome::Exhausted { attempts, last_error } =
                self.gateway.dispatch(&command, &policy).await
            {
                tracing::error!(
                    command_type = %command.command_type,
                    attempts,
                    error = %last_error,
                    "command undeliverable, escalating to timeout"
                );
                escalation = Some(IncomingEvent::timeout(
                    instance.correlation_id.clone(),
                    &instance.current_state,
                    instance.version,
                ));
            }
        }

        if let Some(deadline) = instance.deadline_at {
            self.timeouts.arm_until(
                instance.correlation_id.clone(),
                instance.current_state.clone(),
                instance.version,
                deadline,
            );
        }
        escalation
    }

    fn unmatched(
        &self,
        definition: &SagaDefinition,
        current: &SagaInstance,
        event: &IncomingEvent,
    ) -> Result<EventOutcome> {
        if event.event_type == CANCEL_EVENT && current.current_state.is_compensating() {
            return Ok(self.discard(current, DiscardReason::AlreadyCompensating));
        }

        if let Some(binding) = definition.binding(&event.event_type) {
            let processed = if binding.undo {
                current.is_unwound(&binding.step)
            } else {
                current.has_completed(&binding.step)
            };
            if processed {
                let reason = DiscardReason::Duplicate {
                    step: binding.step.clone(),
                };
                return Ok(self.discard(current, reason));
            }
        }

        metrics::counter!("saga_unexpected_events_total").increment(1);
        tracing::warn!(
            process_type = %current.process_type,
            state = %current.current_state,
            "unexpected event, instance left untouched"
        );
        Err(SagaError::UnexpectedEvent {
            correlation_id: current.correlation_id.clone(),
            state: current.current_state.clone(),
            event_type: event.event_type.clone(),
        })
    }

    fn discard(&self, current: &SagaInstance, reason: DiscardReason) -> EventOutcome {
        metrics::counter!("saga_discarded_events_total").increment(1);
        tracing::info!(
            state = %current.current_state,
            version = %current.version,
            reason = ?reason,
            "event discarded"
        );
        EventOutcome::Discarded(reason)
    }
}

fn enter_step(instance: &mut SagaInstance, step: &StepDefinition, now: DateTime<Utc>) -> Command {
    instance.current_state = step.state.clone();
    instance.attempt = 1;
    instance.deadline_at = Some(deadline_after(now, step.timeout));
    Command {
        correlation_id: instance.correlation_id.clone(),
        command_type: step.command.clone(),
        step: step.name.clone(),
        version: instance.version,
        payload: step.select_payload(&instance.payload),
    }
}

fn enter_undo(
    instance: &mut SagaInstance,
    step: &StepDefinition,
    now: DateTime<Utc>,
) -> Option<Command> {
    let compensation = step.compensation.as_ref()?;
    instance.current_state = SagaState::compensating(&step.name);
    instance.attempt = 1;
    instance.deadline_at = Some(deadline_after(now, compensation.timeout));
    Some(Command {
        correlation_id: instance.correlation_id.clone(),
        command_type: compensation.command.clone(),
        step: step.name.clone(),
        version: instance.version,
        payload: step.select_payload(&instance.payload),
    })
}

fn next_undo(
    executor: &CompensationExecutor<'_>,
    instance: &mut SagaInstance,
    now: DateTime<Utc>,
) -> Option<Command> {
    match executor.next(instance) {
        CompensationPlan::Undo { step, .. } => enter_undo(instance, step, now),
        CompensationPlan::Finished(terminal) => settle(instance, terminal),
    }
}

fn settle(instance: &mut SagaInstance, terminal: SagaState) -> Option<Command> {
    instance.current_state = terminal;
    instance.deadline_at = None;
    None
}

fn describe_failure(step: &StepDefinition, kind: FailureKind, event: &IncomingEvent) -> String {
    match kind {
        FailureKind::Rejected => format!("{}: {}", step.name, event.event_type),
        FailureKind::TimedOut => format!("{}: timed out", step.name),
        FailureKind::Cancelled => format!(
            "{}: cancelled ({})",
            step.name,
            event.cancel_reason().unwrap_or("no reason given")
        ),
    }
}

fn record_terminal(instance: &SagaInstance) {
    let process_type = instance.process_type.clone();
    match instance.current_state {
        SagaState::Completed => {
            metrics::counter!("saga_completed_total", "process_type" => process_type).increment(1);
            tracing::info!(steps = instance.completed_steps.len(), "saga completed");
        }
        SagaState::Compensated => {
            metrics::counter!("saga_compensated_total", "process_type" => process_type)
                .increment(1);
            tracing::info!(
                compensated = ?instance.compensated_steps,
                abandoned = ?instance.abandoned_compensations,
                reason = instance.failure_reason.as_deref().unwrap_or_default(),
                "saga compensated"
            );
        }
        SagaState::Failed => {
            metrics::counter!("saga_failed_total", "process_type" => process_type).increment(1);
            tracing::info!(
                reason = instance.failure_reason.as_deref().unwrap_or_default(),
                "saga failed with nothing to compensate"
            );
        }
        _ => {}
    }
}

/// `now + timeout`, saturating at the latest representable instant.
fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
