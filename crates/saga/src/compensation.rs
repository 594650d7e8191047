//! Unwinding completed steps after a failure.
//!
//! Compensation walks `completed_steps` most-recent-first and undoes each step
//! that declares a compensating command. Each undo gets its own synthetic
//! `Compensating:<Step>` state, so it is persisted, dispatched and timed out
//! through the same path as a forward step.

use common::SagaState;
use instance_store::SagaInstance;

use crate::definition::{SagaDefinition, StepDefinition};

/// What compensation should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum CompensationPlan<'a> {
    /// Undo this step next.
    Undo {
        index: usize,
        step: &'a StepDefinition,
    },
    /// Nothing left to undo; the instance settles in this terminal state.
    Finished(SagaState),
}

/// Chooses undo steps for one definition.
#[derive(Debug, Clone, Copy)]
pub struct CompensationExecutor<'a> {
    definition: &'a SagaDefinition,
}

impl<'a> CompensationExecutor<'a> {
    pub fn new(definition: &'a SagaDefinition) -> Self {
        Self { definition }
    }

    /// Completed steps still owing an undo, in the order they will be undone.
    pub fn pending(&self, instance: &SagaInstance) -> Vec<(usize, &'a StepDefinition)> {
        instance
            .completed_steps
            .iter()
            .rev()
            .filter(|name| !instance.is_unwound(name))
            .filter_map(|name| self.definition.step_by_name(name))
            .filter(|(_, step)| step.is_compensatable())
            .collect()
    }

    /// The next undo, or the terminal state once none remain.
    ///
    /// A saga that never entered an undo state ends `Failed`; one that did
    /// ends `Compensated`, even if some undos were abandoned.
    pub fn next(&self, instance: &SagaInstance) -> CompensationPlan<'a> {
        match self.pending(instance).into_iter().next() {
            Some((index, step)) => CompensationPlan::Undo { index, step },
            None if instance.compensated_steps.is_empty()
                && instance.abandoned_compensations.is_empty() =>
            {
                CompensationPlan::Finished(SagaState::Failed)
            }
            None => CompensationPlan::Finished(SagaState::Compensated),
        }
    }

    /// Returns true if the current undo may be dispatched again after a timeout.
    pub fn may_redispatch(&self, instance: &SagaInstance) -> bool {
        self.definition
            .compensation_retry()
            .should_retry(instance.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{CompensationSpec, DefinitionSpec, StepSpec};
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use common::{CorrelationId, Payload};
    use std::time::Duration;

    fn undoable(name: &str) -> StepSpec {
        StepSpec::new(name, format!("Do{name}"))
            .succeeds_on(format!("{name}Done"))
            .compensate_with(CompensationSpec::new(
                format!("Undo{name}"),
                format!("{name}Undone"),
                Duration::from_secs(5),
            ))
    }

    fn definition() -> SagaDefinition {
        SagaDefinition::compile(
            DefinitionSpec::new("Booking", "BookingRequested")
                .compensation_retry(RetryPolicy::with_max_attempts(2))
                .step(undoable("A"))
                .step(StepSpec::new("B", "DoB").succeeds_on("BDone"))
                .step(undoable("C"))
                .step(StepSpec::new("D", "DoD").succeeds_on("DDone")),
        )
        .unwrap()
    }

    fn instance(completed: &[&str]) -> SagaInstance {
        let mut instance = SagaInstance::new(
            CorrelationId::new("C1"),
            "Booking",
            SagaState::step("AwaitingD"),
            Payload::new(),
            Utc::now(),
        );
        instance.completed_steps = completed.iter().map(|s| s.to_string()).collect();
        instance
    }

    #[test]
    fn test_pending_is_reverse_and_skips_plain_steps() {
        let def = definition();
        let executor = CompensationExecutor::new(&def);
        let names: Vec<&str> = executor
            .pending(&instance(&["A", "B", "C"]))
            .into_iter()
            .map(|(_, step)| step.name.as_str())
            .collect();
        assert_eq!(names, vec!["C", "A"]);
    }

    #[test]
    fn test_next_skips_unwound_steps() {
        let def = definition();
        let executor = CompensationExecutor::new(&def);
        let mut instance = instance(&["A", "B", "C"]);
        instance.compensated_steps.push("C".to_string());

        match executor.next(&instance) {
            CompensationPlan::Undo { index, step } => {
                assert_eq!(index, 0);
                assert_eq!(step.name, "A");
            }
            other => panic!("expected undo of A, got {other:?}"),
        }

        instance.abandoned_compensations.push("A".to_string());
        assert_eq!(
            executor.next(&instance),
            CompensationPlan::Finished(SagaState::Compensated)
        );
    }

    #[test]
    fn test_nothing_to_undo_fails() {
        let def = definition();
        let executor = CompensationExecutor::new(&def);
        assert_eq!(
            executor.next(&instance(&[])),
            CompensationPlan::Finished(SagaState::Failed)
        );
        assert_eq!(
            executor.next(&instance(&["B"])),
            CompensationPlan::Finished(SagaState::Failed)
        );
    }

    #[test]
    fn test_redispatch_budget() {
        let def = definition();
        let executor = CompensationExecutor::new(&def);
        let mut instance = instance(&["A"]);
        assert!(executor.may_redispatch(&instance));
        instance.attempt = 2;
        assert!(!executor.may_redispatch(&instance));
    }
}
