//! Record types written by the recorder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ExecutionId;
use crate::engine::state::{ExecutionStatus, Outcome};
use crate::procedure::{ProcedureDefinition, ProcedureId, StepNumber};

/// How a step was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Completed,
    Skipped,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Immutable record of one resolved step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub execution_id: ExecutionId,
    pub step_number: StepNumber,
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_value: Option<Value>,
    #[serde(default)]
    pub is_deviation: bool,
    /// Skipped by the planner rather than by an operator.
    #[serde(default)]
    pub automatic: bool,
    pub operator_id: String,
    pub timestamp: DateTime<Utc>,
}

impl StepCompletion {
    pub fn completed(
        execution_id: ExecutionId,
        step_number: StepNumber,
        submitted_value: Option<Value>,
        is_deviation: bool,
        operator_id: &str,
    ) -> Self {
        Self {
            execution_id,
            step_number,
            action: StepAction::Completed,
            submitted_value,
            is_deviation,
            automatic: false,
            operator_id: operator_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn skipped(
        execution_id: ExecutionId,
        step_number: StepNumber,
        automatic: bool,
        operator_id: &str,
    ) -> Self {
        Self {
            execution_id,
            step_number,
            action: StepAction::Skipped,
            submitted_value: None,
            is_deviation: false,
            automatic,
            operator_id: operator_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.action == StepAction::Completed
    }
}

/// First record of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHeader {
    pub execution_id: ExecutionId,
    pub procedure_id: ProcedureId,
    pub procedure_version: u32,
    pub operator_id: String,
    pub started_at: DateTime<Utc>,
    /// The definition as it was when the execution started.
    pub definition: ProcedureDefinition,
}

/// Terminal record of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSeal {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_reasons: Vec<String>,
    pub sealed_at: DateTime<Utc>,
}

impl ExecutionSeal {
    /// Whether two seals describe the same terminal state.
    pub fn same_terms(&self, other: &ExecutionSeal) -> bool {
        self.status == other.status
            && self.outcome == other.outcome
            && self.declared_outcome == other.declared_outcome
    }
}

/// One line of an execution's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ExecutionRecord {
    Opened(ExecutionHeader),
    Step(StepCompletion),
    Sealed(ExecutionSeal),
}

impl ExecutionRecord {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            ExecutionRecord::Opened(h) => &h.execution_id,
            ExecutionRecord::Step(c) => &c.execution_id,
            ExecutionRecord::Sealed(s) => &s.execution_id,
        }
    }
}
