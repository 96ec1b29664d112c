//! Execution lifecycle.
//!
//! [`ExecutionStateMachine`] is the only writer of executions. Every
//! operation reloads the execution from the recorder, checks it, persists
//! at most a handful of records, and eagerly advances past automatic skips
//! so the recorded history always matches what the planner offered.
//!
//! Mutations are optimistic. The last resolved step read at load time is
//! passed to the recorder with every append, and a concurrent change
//! surfaces as [`EngineError::ConcurrentModification`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::collaborators::{
    Notification, Notifier, QualityCheckPayload, QualityCheckSink, TracingNotifier,
};
use crate::engine::planner::ExecutionPlanner;
use crate::engine::state::{
    ExecutionStatus, ExecutionView, Outcome, ProcedureExecution, StepOutcome,
};
use crate::engine::validator::StepValidator;
use crate::error::{EngineError, EngineResult};
use crate::procedure::{validate_definition, DefinitionStore, StepDefinition, StepNumber};
use crate::recorder::{
    ExecutionHeader, ExecutionId, ExecutionRecord, ExecutionRecorder, ExecutionSeal,
    StepCompletion,
};

/// Drives executions through their lifecycle.
pub struct ExecutionStateMachine {
    definitions: Arc<dyn DefinitionStore>,
    recorder: Arc<dyn ExecutionRecorder>,
    quality_checks: Option<Arc<dyn QualityCheckSink>>,
    notifier: Arc<dyn Notifier>,
    planner: ExecutionPlanner,
    validator: StepValidator,
}

impl ExecutionStateMachine {
    /// Create a state machine with a logging notifier and no quality-check
    /// collaborator.
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        recorder: Arc<dyn ExecutionRecorder>,
    ) -> Self {
        Self {
            definitions,
            recorder,
            quality_checks: None,
            notifier: Arc::new(TracingNotifier),
            planner: ExecutionPlanner::new(),
            validator: StepValidator::new(),
        }
    }

    pub fn with_quality_checks(mut self, sink: Arc<dyn QualityCheckSink>) -> Self {
        self.quality_checks = Some(sink);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn recorder(&self) -> &Arc<dyn ExecutionRecorder> {
        &self.recorder
    }

    /// Start a new execution of an active procedure.
    pub fn start(
        &self,
        procedure_id: &str,
        operator_id: &str,
    ) -> EngineResult<ProcedureExecution> {
        let definition = self.definitions.get_active_definition(procedure_id)?;
        validate_definition(&definition)?;

        let header = ExecutionHeader {
            execution_id: ExecutionId::new(),
            procedure_id: definition.id.clone(),
            procedure_version: definition.version,
            operator_id: operator_id.to_string(),
            started_at: Utc::now(),
            definition: (*definition).clone(),
        };
        self.recorder.open(header.clone())?;

        let mut execution =
            ProcedureExecution::from_records(&[ExecutionRecord::Opened(header)])?;
        let pending = self
            .planner
            .next_step(&mut execution, self.recorder.as_ref(), operator_id)?;

        info!(
            execution_id = %execution.id,
            procedure_id = %execution.procedure_id,
            version = execution.procedure_version,
            operator_id,
            pending_step = ?pending,
            "Execution started"
        );
        Ok(execution)
    }

    /// Record a completed step.
    ///
    /// `step_number` must be the pending step. The value is validated
    /// against the step's input contract; a reading outside the acceptable
    /// range is recorded as a deviation rather than rejected.
    pub fn submit_step(
        &self,
        execution_id: &ExecutionId,
        step_number: StepNumber,
        value: Option<Value>,
        operator_id: &str,
    ) -> EngineResult<StepOutcome> {
        let mut execution = self.load(execution_id)?;
        let recorded_before = execution.completions.len();
        let step = self.eligible_step(&execution, step_number)?;

        let validation = self.validator.validate(&step, value.as_ref())?;

        self.planner
            .next_step(&mut execution, self.recorder.as_ref(), operator_id)?;
        let expected_last = execution.last_resolved_step();

        let quality_check = if step.quality_check_required {
            Some(self.record_quality_check(
                &execution,
                &step,
                value.as_ref(),
                validation.is_deviation,
                operator_id,
            )?)
        } else {
            None
        };

        let completion = StepCompletion::completed(
            execution.id,
            step_number,
            value,
            validation.is_deviation,
            operator_id,
        );
        if let Err(e) = self.recorder.append(completion.clone(), expected_last) {
            if let (EngineError::ConcurrentModification { .. }, Some(payload)) =
                (&e, &quality_check)
            {
                self.supersede_quality_check(&execution.id, step_number, payload);
            }
            return Err(e);
        }
        execution.apply_record(&ExecutionRecord::Step(completion.clone()));

        info!(
            execution_id = %execution.id,
            step_number,
            operator_id,
            is_deviation = validation.is_deviation,
            "Step completed"
        );

        if validation.is_deviation {
            warn!(
                execution_id = %execution.id,
                step_number,
                step_title = %step.title,
                measured = ?validation.measured,
                acceptable_range = ?step.acceptable_range,
                "Recorded value deviates from acceptable range"
            );
            self.notify(Notification::Deviation {
                execution_id: execution.id,
                procedure_id: execution.procedure_id.clone(),
                step_number,
                step_title: step.title.clone(),
                value: completion.submitted_value.clone(),
                acceptable_range: step.acceptable_range.clone(),
                operator_id: operator_id.to_string(),
            });
        }

        let pending_step = self.advance(&mut execution, operator_id)?;
        Ok(StepOutcome {
            is_deviation: completion.is_deviation,
            auto_skipped: auto_skipped_since(&execution, recorded_before),
            completion,
            pending_step,
        })
    }

    /// Skip the pending step on the operator's behalf.
    ///
    /// Only optional steps and steps whose skip conditions hold may be
    /// skipped. Critical steps never can.
    pub fn skip_step(
        &self,
        execution_id: &ExecutionId,
        step_number: StepNumber,
        operator_id: &str,
    ) -> EngineResult<StepOutcome> {
        let mut execution = self.load(execution_id)?;
        let recorded_before = execution.completions.len();
        execution.ensure_in_progress()?;
        let is_critical = execution
            .definition
            .step(step_number)
            .ok_or(EngineError::StepNotFound { step_number })?
            .is_critical;
        if is_critical {
            return Err(EngineError::CriticalStepCannotBeSkipped { step_number });
        }
        let step = self.eligible_step(&execution, step_number)?;

        if !self.planner.is_skip_eligible(&step, &execution.context) {
            return Err(EngineError::StepNotSkippable { step_number });
        }

        self.planner
            .next_step(&mut execution, self.recorder.as_ref(), operator_id)?;
        let skip = StepCompletion::skipped(execution.id, step_number, false, operator_id);
        self.recorder
            .append(skip.clone(), execution.last_resolved_step())?;
        execution.apply_record(&ExecutionRecord::Step(skip.clone()));

        info!(
            execution_id = %execution.id,
            step_number,
            operator_id,
            "Step skipped"
        );

        let pending_step = self.advance(&mut execution, operator_id)?;
        Ok(StepOutcome {
            is_deviation: false,
            auto_skipped: auto_skipped_since(&execution, recorded_before),
            completion: skip,
            pending_step,
        })
    }

    /// The pending step, recording any automatic skips that precede it.
    ///
    /// Fails on a terminal execution. Use [`Self::pending_step`] or
    /// [`Self::view`] to read a sealed one.
    pub fn next_step(
        &self,
        execution_id: &ExecutionId,
        operator_id: &str,
    ) -> EngineResult<Option<StepDefinition>> {
        let mut execution = self.load(execution_id)?;
        execution.ensure_in_progress()?;
        let next = self
            .planner
            .next_step(&mut execution, self.recorder.as_ref(), operator_id)?;
        Ok(next.and_then(|n| execution.definition.step(n).cloned()))
    }

    /// Preview of the pending step. Writes nothing.
    pub fn pending_step(&self, execution_id: &ExecutionId) -> EngineResult<Option<StepDefinition>> {
        let execution = self.load(execution_id)?;
        self.preview(&execution)
    }

    /// Seal the execution with its authoritative outcome.
    ///
    /// A missing critical step or a deviating critical safety check forces
    /// [`Outcome::Failure`] whatever the caller declared. Finalizing again
    /// with the same declared outcome returns the sealed execution.
    pub fn finalize(
        &self,
        execution_id: &ExecutionId,
        declared_outcome: Outcome,
        operator_id: &str,
    ) -> EngineResult<ProcedureExecution> {
        let mut execution = self.load(execution_id)?;

        if execution.is_terminal() {
            if execution.status == ExecutionStatus::Abandoned {
                return Err(EngineError::ExecutionNotInProgress {
                    execution_id: execution.id,
                    status: execution.status,
                });
            }
            if execution.declared_outcome == Some(declared_outcome) {
                debug!(execution_id = %execution.id, "Finalize repeated with same outcome");
                return Ok(execution);
            }
            return Err(EngineError::AlreadySealed {
                execution_id: execution.id,
            });
        }

        if let Some(pending) = self
            .planner
            .next_step(&mut execution, self.recorder.as_ref(), operator_id)?
        {
            return Err(EngineError::StepsRemaining { pending });
        }

        let failure_reasons = failure_reasons(&execution);
        let outcome = if failure_reasons.is_empty() {
            declared_outcome
        } else {
            Outcome::Failure
        };
        let status = match outcome {
            Outcome::Failure => ExecutionStatus::Failed,
            Outcome::Success | Outcome::Conditional => ExecutionStatus::Completed,
        };

        let seal = self.recorder.seal(ExecutionSeal {
            execution_id: execution.id,
            status,
            outcome: Some(outcome),
            declared_outcome: Some(declared_outcome),
            reason: None,
            failure_reasons: failure_reasons.clone(),
            sealed_at: Utc::now(),
        })?;
        execution.apply_record(&ExecutionRecord::Sealed(seal));

        if outcome != declared_outcome {
            warn!(
                execution_id = %execution.id,
                declared_outcome = %declared_outcome,
                outcome = %outcome,
                reasons = ?failure_reasons,
                "Declared outcome overridden"
            );
        }
        info!(
            execution_id = %execution.id,
            status = %execution.status,
            outcome = %outcome,
            operator_id,
            "Execution finalized"
        );

        if outcome == Outcome::Failure {
            self.notify(Notification::ExecutionFailed {
                execution_id: execution.id,
                procedure_id: execution.procedure_id.clone(),
                declared_outcome,
                reasons: failure_reasons,
            });
        }

        Ok(execution)
    }

    /// Terminate an in-progress execution early.
    pub fn abandon(
        &self,
        execution_id: &ExecutionId,
        reason: &str,
    ) -> EngineResult<ProcedureExecution> {
        let mut execution = self.load(execution_id)?;
        execution.ensure_in_progress()?;

        let seal = self.recorder.seal(ExecutionSeal {
            execution_id: execution.id,
            status: ExecutionStatus::Abandoned,
            outcome: None,
            declared_outcome: None,
            reason: Some(reason.to_string()),
            failure_reasons: Vec::new(),
            sealed_at: Utc::now(),
        })?;
        execution.apply_record(&ExecutionRecord::Sealed(seal));

        info!(execution_id = %execution.id, reason, "Execution abandoned");
        Ok(execution)
    }

    /// Current state of an execution.
    pub fn execution(&self, execution_id: &ExecutionId) -> EngineResult<ProcedureExecution> {
        self.load(execution_id)
    }

    /// Execution with its pending step, preconditions and progress.
    pub fn view(&self, execution_id: &ExecutionId) -> EngineResult<ExecutionView> {
        let execution = self.load(execution_id)?;
        let pending_step = self.preview(&execution)?;
        let preconditions = pending_step
            .as_ref()
            .map(|s| s.preconditions())
            .filter(|p| !p.is_empty());
        Ok(ExecutionView {
            progress: execution.progress(),
            execution,
            pending_step,
            preconditions,
        })
    }

    fn load(&self, execution_id: &ExecutionId) -> EngineResult<ProcedureExecution> {
        let records = self.recorder.records(execution_id)?;
        ProcedureExecution::from_records(&records)
    }

    fn preview(&self, execution: &ProcedureExecution) -> EngineResult<Option<StepDefinition>> {
        let plan = self.planner.plan(execution, &execution.definition)?;
        Ok(plan
            .next
            .and_then(|n| execution.definition.step(n).cloned()))
    }

    /// Checks shared by submit and skip: the execution is live, the step
    /// exists, is unresolved, and is the one the planner offers.
    fn eligible_step(
        &self,
        execution: &ProcedureExecution,
        step_number: StepNumber,
    ) -> EngineResult<StepDefinition> {
        execution.ensure_in_progress()?;

        let step = execution
            .definition
            .step(step_number)
            .cloned()
            .ok_or(EngineError::StepNotFound { step_number })?;

        if execution.is_resolved(step_number) {
            return Err(EngineError::StepAlreadyResolved { step_number });
        }

        let plan = self.planner.plan(execution, &execution.definition)?;
        if plan.next != Some(step_number) {
            return Err(EngineError::StepNotEligible {
                requested: step_number,
                pending: plan.next,
            });
        }
        Ok(step)
    }

    fn record_quality_check(
        &self,
        execution: &ProcedureExecution,
        step: &StepDefinition,
        value: Option<&Value>,
        is_deviation: bool,
        operator_id: &str,
    ) -> EngineResult<QualityCheckPayload> {
        let step_number = step.step_number;
        let Some(sink) = &self.quality_checks else {
            return Err(EngineError::QualityCheckRequired {
                step_number,
                reason: "no quality-check collaborator configured".to_string(),
            });
        };

        let payload = QualityCheckPayload {
            procedure_id: execution.procedure_id.clone(),
            step_title: step.title.clone(),
            value: value.cloned(),
            is_deviation,
            operator_id: operator_id.to_string(),
            acceptable_range: step.acceptable_range.clone(),
            expected_last: execution.last_resolved_step(),
        };
        sink.record_quality_check(&execution.id, step_number, &payload)
            .map(|()| payload.clone())
            .map_err(|e| {
                warn!(
                    execution_id = %execution.id,
                    step_number,
                    error = %e,
                    "Quality check failed, step left unresolved"
                );
                EngineError::QualityCheckRequired {
                    step_number,
                    reason: e.to_string(),
                }
            })
    }

    /// Tell the quality-check sink that a check it accepted belongs to a
    /// submission that lost the race for the step.
    fn supersede_quality_check(
        &self,
        execution_id: &ExecutionId,
        step_number: StepNumber,
        payload: &QualityCheckPayload,
    ) {
        let Some(sink) = &self.quality_checks else {
            return;
        };
        warn!(
            execution_id = %execution_id,
            step_number,
            operator_id = %payload.operator_id,
            "Quality check superseded by a concurrent submission"
        );
        if let Err(e) = sink.quality_check_superseded(execution_id, step_number, payload) {
            warn!(
                execution_id = %execution_id,
                step_number,
                error = %e,
                "Superseded quality check not delivered"
            );
        }
    }

    /// Advance past automatic skips after a successful append. If another
    /// call moved the execution in the meantime, fall back to a fresh
    /// preview rather than failing a step that is already recorded.
    fn advance(
        &self,
        execution: &mut ProcedureExecution,
        operator_id: &str,
    ) -> EngineResult<Option<StepNumber>> {
        match self
            .planner
            .next_step(execution, self.recorder.as_ref(), operator_id)
        {
            Ok(next) => Ok(next),
            Err(EngineError::ConcurrentModification { .. }) => {
                debug!(execution_id = %execution.id, "Execution advanced concurrently");
                Ok(self.pending_step(&execution.id)?.map(|s| s.step_number))
            }
            Err(e) => Err(e),
        }
    }

    fn notify(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification) {
            warn!(
                execution_id = %notification.execution_id(),
                error = %e,
                "Notification not delivered"
            );
        }
    }
}

/// Automatic skips recorded after the first `recorded_before` completions.
fn auto_skipped_since(execution: &ProcedureExecution, recorded_before: usize) -> Vec<StepNumber> {
    execution.completions[recorded_before..]
        .iter()
        .filter(|c| c.automatic)
        .map(|c| c.step_number)
        .collect()
}

/// Reasons the execution cannot succeed, in step order.
fn failure_reasons(execution: &ProcedureExecution) -> Vec<String> {
    let mut reasons = Vec::new();
    for step in execution.definition.critical_steps() {
        match execution.completion(step.step_number) {
            Some(c) if c.is_completed() => {
                if c.is_deviation && step.deviation_blocks_success() {
                    let range = step
                        .acceptable_range
                        .as_ref()
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    reasons.push(format!(
                        "critical safety check {} ({}) deviated from {}",
                        step.step_number, step.title, range
                    ));
                }
            }
            Some(_) => reasons.push(format!(
                "critical step {} ({}) was skipped",
                step.step_number, step.title
            )),
            None => reasons.push(format!(
                "critical step {} ({}) was not completed",
                step.step_number, step.title
            )),
        }
    }
    reasons
}
