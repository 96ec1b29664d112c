//! Notification collaborator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::CollaboratorError;
use crate::engine::state::Outcome;
use crate::procedure::{AcceptableRange, ProcedureId, StepNumber};
use crate::recorder::ExecutionId;

/// Events the engine reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A recorded value fell outside its acceptable range.
    Deviation {
        execution_id: ExecutionId,
        procedure_id: ProcedureId,
        step_number: StepNumber,
        step_title: String,
        value: Option<Value>,
        acceptable_range: Option<AcceptableRange>,
        operator_id: String,
    },
    /// Finalize produced a failure.
    ExecutionFailed {
        execution_id: ExecutionId,
        procedure_id: ProcedureId,
        declared_outcome: Outcome,
        reasons: Vec<String>,
    },
}

impl Notification {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Notification::Deviation { execution_id, .. }
            | Notification::ExecutionFailed { execution_id, .. } => execution_id,
        }
    }
}

/// Receives notifications. The engine neither waits on nor retries
/// delivery.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError>;
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        match notification {
            Notification::Deviation {
                execution_id,
                step_number,
                step_title,
                value,
                acceptable_range,
                ..
            } => {
                let range = acceptable_range
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default();
                let value = value.as_ref().map(|v| v.to_string()).unwrap_or_default();
                warn!(
                    execution_id = %execution_id,
                    step_number,
                    step_title = %step_title,
                    value = %value,
                    acceptable_range = %range,
                    "Deviation notification"
                );
            }
            Notification::ExecutionFailed {
                execution_id,
                declared_outcome,
                reasons,
                ..
            } => {
                info!(
                    execution_id = %execution_id,
                    declared_outcome = %declared_outcome,
                    reasons = ?reasons,
                    "Execution failed notification"
                );
            }
        }
        Ok(())
    }
}
