//! Quality-check collaborator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CollaboratorError;
use crate::procedure::{AcceptableRange, ProcedureId, StepNumber};
use crate::recorder::ExecutionId;

/// What the engine sends when a step requires a quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheckPayload {
    pub procedure_id: ProcedureId,
    pub step_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub is_deviation: bool,
    pub operator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptable_range: Option<AcceptableRange>,
    /// Last resolved step the submission was based on. The completion is
    /// only recorded if the execution is still at this position.
    #[serde(default)]
    pub expected_last: Option<StepNumber>,
}

/// Records quality checks in an external system.
///
/// Called synchronously before the completion is appended. An error leaves
/// the step unresolved so the caller can resubmit. Checks must be
/// idempotent per execution and step: a resubmission after an error, or a
/// racing submission, sends the same step again.
pub trait QualityCheckSink: Send + Sync {
    fn record_quality_check(
        &self,
        execution_id: &ExecutionId,
        step_number: StepNumber,
        payload: &QualityCheckPayload,
    ) -> Result<(), CollaboratorError>;

    /// A recorded check whose completion lost the append to a concurrent
    /// submission. The step was resolved by the other submission, not by
    /// this payload.
    fn quality_check_superseded(
        &self,
        _execution_id: &ExecutionId,
        _step_number: StepNumber,
        _payload: &QualityCheckPayload,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}
