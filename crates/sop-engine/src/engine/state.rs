//! Execution state reconstruction from records.
//!
//! A [`ProcedureExecution`] is never stored directly. It is rebuilt from the
//! recorder's records on every operation, so readers always see exactly
//! what has been persisted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::procedure::{Preconditions, ProcedureDefinition, ProcedureId, StepDefinition, StepNumber};
use crate::recorder::{ExecutionId, ExecutionRecord, StepAction, StepCompletion};

/// Recorded values keyed by step number.
pub type ExecutionContext = BTreeMap<StepNumber, Value>;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
    Abandoned,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Outcome of a finalized execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Conditional,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Conditional => write!(f, "conditional"),
        }
    }
}

/// One run of a procedure, reconstructed from its records.
#[derive(Debug, Clone, Serialize)]
pub struct ProcedureExecution {
    pub id: ExecutionId,
    pub procedure_id: ProcedureId,
    pub procedure_version: u32,
    pub operator_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Outcome the caller asked for at finalize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_outcome: Option<Outcome>,
    pub completions: Vec<StepCompletion>,
    pub context: ExecutionContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abandon_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failure_reasons: Vec<String>,
    /// Definition snapshot taken at start.
    #[serde(skip)]
    pub definition: Arc<ProcedureDefinition>,
}

impl ProcedureExecution {
    /// Reconstruct an execution from its records.
    pub fn from_records(records: &[ExecutionRecord]) -> EngineResult<Self> {
        let start = Instant::now();

        let header = match records.first() {
            Some(ExecutionRecord::Opened(header)) => header,
            _ => {
                return Err(EngineError::Storage(
                    "execution history does not start with an opened record".to_string(),
                ))
            }
        };

        let mut execution = Self {
            id: header.execution_id,
            procedure_id: header.procedure_id.clone(),
            procedure_version: header.procedure_version,
            operator_id: header.operator_id.clone(),
            status: ExecutionStatus::InProgress,
            started_at: header.started_at,
            completed_at: None,
            outcome: None,
            declared_outcome: None,
            completions: Vec::new(),
            context: ExecutionContext::new(),
            abandon_reason: None,
            failure_reasons: Vec::new(),
            definition: Arc::new(header.definition.clone()),
        };

        for record in &records[1..] {
            execution.apply_record(record);
        }

        let duration = start.elapsed();
        tracing::debug!(
            target: "sop.performance",
            execution_id = %execution.id,
            phase = "state_reconstruction",
            record_count = records.len(),
            duration_ms = %duration.as_millis(),
            "State reconstructed from records"
        );

        if duration.as_millis() > 100 {
            tracing::warn!(
                target: "sop.performance",
                execution_id = %execution.id,
                record_count = records.len(),
                duration_ms = %duration.as_millis(),
                "Slow state reconstruction detected"
            );
        }

        Ok(execution)
    }

    /// Apply a single record to the state.
    pub fn apply_record(&mut self, record: &ExecutionRecord) {
        match record {
            ExecutionRecord::Opened(_) => {}
            ExecutionRecord::Step(completion) => {
                if completion.action == StepAction::Completed {
                    if let Some(value) = &completion.submitted_value {
                        self.context.insert(completion.step_number, value.clone());
                    }
                }
                self.completions.push(completion.clone());
            }
            ExecutionRecord::Sealed(seal) => {
                self.status = seal.status;
                self.outcome = seal.outcome;
                self.declared_outcome = seal.declared_outcome;
                self.completed_at = Some(seal.sealed_at);
                self.failure_reasons = seal.failure_reasons.clone();
                if seal.status == ExecutionStatus::Abandoned {
                    self.abandon_reason = seal.reason.clone();
                }
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The highest resolved step, used as the optimistic concurrency token.
    pub fn last_resolved_step(&self) -> Option<StepNumber> {
        self.completions.last().map(|c| c.step_number)
    }

    pub fn completion(&self, step_number: StepNumber) -> Option<&StepCompletion> {
        self.completions.iter().find(|c| c.step_number == step_number)
    }

    pub fn is_resolved(&self, step_number: StepNumber) -> bool {
        self.completion(step_number).is_some()
    }

    pub fn ensure_in_progress(&self) -> EngineResult<()> {
        if self.is_terminal() {
            return Err(EngineError::ExecutionNotInProgress {
                execution_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn progress(&self) -> Progress {
        let completed = self
            .completions
            .iter()
            .filter(|c| c.action == StepAction::Completed)
            .count();
        Progress {
            total_steps: self.definition.steps.len(),
            completed,
            skipped: self.completions.len() - completed,
            deviations: self.completions.iter().filter(|c| c.is_deviation).count(),
        }
    }
}

/// Step counts for rendering progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total_steps: usize,
    pub completed: usize,
    pub skipped: usize,
    pub deviations: usize,
}

/// Everything a caller needs to render an execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub execution: ProcedureExecution,
    /// The planner's preview. `None` once the execution is terminal or has
    /// nothing left to do.
    pub pending_step: Option<StepDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<Preconditions>,
    pub progress: Progress,
}

/// Result of a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub completion: StepCompletion,
    pub is_deviation: bool,
    /// Steps the planner skipped automatically while advancing.
    pub auto_skipped: Vec<StepNumber>,
    /// The next step awaiting the operator.
    pub pending_step: Option<StepNumber>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{DefinitionStatus, StepType};
    use crate::recorder::{ExecutionHeader, ExecutionSeal};
    use serde_json::json;

    fn opened() -> (ExecutionId, ExecutionRecord) {
        let id = ExecutionId::new();
        let definition = ProcedureDefinition::new(
            "sanitation",
            DefinitionStatus::Active,
            vec![
                StepDefinition::new(1, "Rinse", StepType::Action),
                StepDefinition::new(2, "Sanitizer ppm", StepType::Measurement),
                StepDefinition::new(3, "Sign off", StepType::Action),
            ],
        );
        let header = ExecutionHeader {
            execution_id: id,
            procedure_id: "sanitation".to_string(),
            procedure_version: 1,
            operator_id: "op-1".to_string(),
            started_at: Utc::now(),
            definition,
        };
        (id, ExecutionRecord::Opened(header))
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ExecutionStatus::InProgress.to_string(), "in_progress");
        assert_eq!(Outcome::Conditional.to_string(), "conditional");
        assert!(ExecutionStatus::Abandoned.is_terminal());
        assert!(!ExecutionStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_from_records_builds_context() {
        let (id, opened) = opened();
        let records = vec![
            opened,
            ExecutionRecord::Step(StepCompletion::completed(id, 1, Some(json!("done")), false, "op-1")),
            ExecutionRecord::Step(StepCompletion::completed(id, 2, Some(json!(150)), true, "op-1")),
        ];

        let execution = ProcedureExecution::from_records(&records).unwrap();
        assert_eq!(execution.status, ExecutionStatus::InProgress);
        assert_eq!(execution.last_resolved_step(), Some(2));
        assert_eq!(execution.context.get(&1), Some(&json!("done")));
        assert_eq!(execution.context.get(&2), Some(&json!(150)));
        assert!(execution.is_resolved(1));
        assert!(!execution.is_resolved(3));

        let progress = execution.progress();
        assert_eq!(progress.total_steps, 3);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.deviations, 1);
    }

    #[test]
    fn test_skips_do_not_enter_context() {
        let (id, opened) = opened();
        let records = vec![
            opened,
            ExecutionRecord::Step(StepCompletion::skipped(id, 1, true, "op-1")),
        ];
        let execution = ProcedureExecution::from_records(&records).unwrap();
        assert!(execution.context.is_empty());
        assert_eq!(execution.progress().skipped, 1);
    }

    #[test]
    fn test_seal_applies_terminal_state() {
        let (id, opened) = opened();
        let sealed_at = Utc::now();
        let records = vec![
            opened,
            ExecutionRecord::Sealed(ExecutionSeal {
                execution_id: id,
                status: ExecutionStatus::Abandoned,
                outcome: None,
                declared_outcome: None,
                reason: Some("line stopped".to_string()),
                failure_reasons: Vec::new(),
                sealed_at,
            }),
        ];
        let execution = ProcedureExecution::from_records(&records).unwrap();
        assert!(execution.is_terminal());
        assert_eq!(execution.completed_at, Some(sealed_at));
        assert_eq!(execution.abandon_reason.as_deref(), Some("line stopped"));
        assert!(matches!(
            execution.ensure_in_progress(),
            Err(EngineError::ExecutionNotInProgress {
                status: ExecutionStatus::Abandoned,
                ..
            })
        ));
    }

    #[test]
    fn test_from_records_requires_header() {
        assert!(ProcedureExecution::from_records(&[]).is_err());
    }
}
