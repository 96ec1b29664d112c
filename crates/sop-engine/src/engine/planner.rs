//! Next-step planning.
//!
//! The pending step is always derived, never stored. [`ExecutionPlanner::plan`]
//! is pure: it returns the steps that would be skipped automatically and the
//! step the operator must act on next. [`ExecutionPlanner::next_step`]
//! persists those automatic skips before returning.

use tracing::debug;

use crate::engine::evaluator::ConditionEvaluator;
use crate::engine::state::{ExecutionContext, ProcedureExecution};
use crate::error::{EngineError, EngineResult};
use crate::procedure::{ProcedureDefinition, StepDefinition, StepNumber};
use crate::recorder::{ExecutionRecord, ExecutionRecorder, StepAction, StepCompletion};

/// What the planner would do from the current position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Steps to record as skipped, ascending.
    pub auto_skips: Vec<StepNumber>,
    /// The step awaiting the operator. `None` when nothing remains.
    pub next: Option<StepNumber>,
}

/// Computes the next eligible step of an execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionPlanner {
    evaluator: ConditionEvaluator,
}

impl ExecutionPlanner {
    pub fn new() -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
        }
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    /// Whether the step's skip conditions hold. Never true for critical steps.
    pub fn skip_conditions_hold(&self, step: &StepDefinition, context: &ExecutionContext) -> bool {
        !step.is_critical && self.evaluator.evaluate(&step.skip_conditions, context)
    }

    /// Whether an operator may skip the step.
    pub fn is_skip_eligible(&self, step: &StepDefinition, context: &ExecutionContext) -> bool {
        !step.is_critical && (step.is_optional || self.skip_conditions_hold(step, context))
    }

    /// First step to consider: a resolved branch target, the successor of
    /// the last resolved step, or the first step.
    fn start_position(
        &self,
        execution: &ProcedureExecution,
        definition: &ProcedureDefinition,
    ) -> EngineResult<Option<StepNumber>> {
        let Some(last) = execution.completions.last() else {
            return Ok(definition.first_step().map(|s| s.step_number));
        };

        if last.action == StepAction::Completed {
            if let Some(step) = definition.step(last.step_number) {
                if let Some(target) = self
                    .evaluator
                    .resolve_branch(&step.conditional_logic, &execution.context)
                {
                    if target <= step.step_number || definition.step(target).is_none() {
                        return Err(EngineError::InvalidBranchTarget {
                            from: step.step_number,
                            target,
                        });
                    }
                    debug!(
                        execution_id = %execution.id,
                        from = step.step_number,
                        target,
                        "Branch rule matched"
                    );
                    return Ok(Some(target));
                }
            }
        }

        Ok(definition.successor(last.step_number).map(|s| s.step_number))
    }

    /// Compute the plan without side effects.
    pub fn plan(
        &self,
        execution: &ProcedureExecution,
        definition: &ProcedureDefinition,
    ) -> EngineResult<Plan> {
        let mut plan = Plan::default();
        if execution.is_terminal() {
            return Ok(plan);
        }
        let Some(start) = self.start_position(execution, definition)? else {
            return Ok(plan);
        };

        for step in definition.steps_from(start) {
            if execution.is_resolved(step.step_number) {
                continue;
            }
            if step.is_critical {
                plan.next = Some(step.step_number);
                return Ok(plan);
            }
            if self.skip_conditions_hold(step, &execution.context) {
                plan.auto_skips.push(step.step_number);
                continue;
            }
            plan.next = Some(step.step_number);
            return Ok(plan);
        }
        Ok(plan)
    }

    /// The pending step, recording any automatic skips on the way.
    ///
    /// Skips are appended with the execution's last resolved step as the
    /// expected position, so a concurrent mutation surfaces as
    /// [`EngineError::ConcurrentModification`]. `execution` is updated with
    /// every record written.
    pub fn next_step(
        &self,
        execution: &mut ProcedureExecution,
        recorder: &dyn ExecutionRecorder,
        operator_id: &str,
    ) -> EngineResult<Option<StepNumber>> {
        let definition = execution.definition.clone();
        let plan = self.plan(execution, &definition)?;

        for step_number in plan.auto_skips {
            let expected = execution.last_resolved_step();
            let skip = StepCompletion::skipped(execution.id, step_number, true, operator_id);
            recorder.append(skip.clone(), expected)?;
            debug!(
                execution_id = %execution.id,
                step_number,
                "Step skipped automatically"
            );
            execution.apply_record(&ExecutionRecord::Step(skip));
        }

        Ok(plan.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{DefinitionStatus, StepType};
    use crate::recorder::{ExecutionHeader, ExecutionId};
    use chrono::Utc;
    use serde_json::json;

    fn definition(yaml: &str) -> ProcedureDefinition {
        crate::procedure::parse_definition(yaml).unwrap()
    }

    fn execution(definition: &ProcedureDefinition) -> ProcedureExecution {
        let header = ExecutionHeader {
            execution_id: ExecutionId::new(),
            procedure_id: definition.id.clone(),
            procedure_version: definition.version,
            operator_id: "op".to_string(),
            started_at: Utc::now(),
            definition: definition.clone(),
        };
        ProcedureExecution::from_records(&[ExecutionRecord::Opened(header)]).unwrap()
    }

    fn complete(execution: &mut ProcedureExecution, step: StepNumber, value: serde_json::Value) {
        let completion = StepCompletion::completed(execution.id, step, Some(value), false, "op");
        execution.apply_record(&ExecutionRecord::Step(completion));
    }

    const CIP: &str = r#"
id: cip
status: active
steps:
  - {stepNumber: 1, title: Pre-rinse done?, stepType: decision, inputType: text}
  - stepNumber: 2
    title: Extra rinse
    stepType: action
    isOptional: true
    skipConditions:
      - {field: 1, operator: equals, value: done}
  - stepNumber: 3
    title: Caustic wash
    stepType: safety_check
    isCritical: true
    skipConditions:
      - {field: 1, operator: equals, value: done}
  - {stepNumber: 4, title: Final rinse, stepType: action}
"#;

    #[test]
    fn test_first_step() {
        let definition = definition(CIP);
        let execution = execution(&definition);
        let plan = ExecutionPlanner::new().plan(&execution, &definition).unwrap();
        assert_eq!(plan.next, Some(1));
        assert!(plan.auto_skips.is_empty());
    }

    #[test]
    fn test_skip_conditions_and_critical_steps() {
        let definition = definition(CIP);
        let mut execution = execution(&definition);
        complete(&mut execution, 1, json!("done"));

        let plan = ExecutionPlanner::new().plan(&execution, &definition).unwrap();
        assert_eq!(plan.auto_skips, vec![2]);
        assert_eq!(plan.next, Some(3));
    }

    #[test]
    fn test_no_skip_when_condition_fails() {
        let definition = definition(CIP);
        let mut execution = execution(&definition);
        complete(&mut execution, 1, json!("partial"));

        let plan = ExecutionPlanner::new().plan(&execution, &definition).unwrap();
        assert!(plan.auto_skips.is_empty());
        assert_eq!(plan.next, Some(2));
    }

    #[test]
    fn test_branch_jumps_forward() {
        let definition = definition(
            r#"
id: branch
status: active
steps:
  - stepNumber: 1
    title: Leak found?
    stepType: decision
    inputType: checkbox
    conditionalLogic:
      - {field: 1, operator: isFalse, target: 4}
  - {stepNumber: 2, title: Isolate, stepType: action}
  - {stepNumber: 3, title: Repair, stepType: action}
  - {stepNumber: 4, title: Restart, stepType: action}
"#,
        );
        let planner = ExecutionPlanner::new();

        let mut no_leak = execution(&definition);
        complete(&mut no_leak, 1, json!(false));
        assert_eq!(planner.plan(&no_leak, &definition).unwrap().next, Some(4));

        let mut leak = execution(&definition);
        complete(&mut leak, 1, json!(true));
        assert_eq!(planner.plan(&leak, &definition).unwrap().next, Some(2));
    }

    #[test]
    fn test_backward_branch_is_rejected() {
        let mut definition = ProcedureDefinition::new(
            "loop",
            DefinitionStatus::Active,
            vec![
                StepDefinition::new(1, "One", StepType::Action),
                StepDefinition::new(2, "Two", StepType::Decision),
            ],
        );
        definition.steps[1].conditional_logic = serde_json::from_value(json!([
            {"field": 2, "operator": "isTrue", "target": 1}
        ]))
        .unwrap();

        let mut execution = execution(&definition);
        complete(&mut execution, 1, json!("ok"));
        complete(&mut execution, 2, json!(true));

        let err = ExecutionPlanner::new()
            .plan(&execution, &definition)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidBranchTarget { from: 2, target: 1 }
        ));
    }

    #[test]
    fn test_exhausted_plan() {
        let definition = definition(CIP);
        let mut execution = execution(&definition);
        for (n, v) in [(1, "partial"), (2, "ok"), (3, "ok"), (4, "ok")] {
            complete(&mut execution, n, json!(v));
        }
        assert_eq!(
            ExecutionPlanner::new().plan(&execution, &definition).unwrap(),
            Plan::default()
        );
    }

    #[test]
    fn test_skip_eligibility() {
        let definition = definition(CIP);
        let planner = ExecutionPlanner::new();
        let done: ExecutionContext = [(1, json!("done"))].into_iter().collect();
        let empty = ExecutionContext::new();

        assert!(planner.is_skip_eligible(definition.step(2).unwrap(), &empty));
        assert!(!planner.is_skip_eligible(definition.step(3).unwrap(), &done));
        assert!(!planner.is_skip_eligible(definition.step(4).unwrap(), &empty));
    }
}
