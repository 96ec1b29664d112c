//! Error types for the SOP execution engine.
//!
//! Every failure the engine can report is a variant of [`EngineError`].
//! Variants are grouped into the classes of [`ErrorKind`] so callers can
//! decide whether to fix input, refetch state, retry, or start over.

use thiserror::Error;

use crate::engine::state::ExecutionStatus;
use crate::procedure::{DefinitionStatus, ProcedureId, StepNumber};
use crate::recorder::ExecutionId;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No definition is registered under the id.
    #[error("Procedure definition not found: {0}")]
    DefinitionNotFound(ProcedureId),

    /// The definition exists but may not be executed.
    #[error("Procedure definition {procedure_id} is {status}, only active definitions can run")]
    DefinitionNotActive {
        procedure_id: ProcedureId,
        status: DefinitionStatus,
    },

    /// The definition violates a structural rule.
    #[error("Invalid procedure definition: {0}")]
    InvalidDefinition(String),

    /// No execution with the id has been recorded.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// The step number does not exist in the procedure.
    #[error("Step {step_number} does not exist in the procedure")]
    StepNotFound { step_number: StepNumber },

    /// The step is not the one the planner offers next.
    #[error("Step {requested} is not eligible, pending step is {}", describe_position(.pending))]
    StepNotEligible {
        requested: StepNumber,
        pending: Option<StepNumber>,
    },

    /// A completion already exists for the step.
    #[error("Step {step_number} is already resolved")]
    StepAlreadyResolved { step_number: StepNumber },

    /// Finalize was called while the planner still offers a step.
    #[error("Execution still has steps remaining, next is step {pending}")]
    StepsRemaining { pending: StepNumber },

    /// A branch rule points backwards or at a missing step.
    #[error("Step {from} branches to invalid target {target}")]
    InvalidBranchTarget { from: StepNumber, target: StepNumber },

    /// Manual skip of a step that is neither optional nor skip-eligible.
    #[error("Step {step_number} is not optional and its skip conditions do not hold")]
    StepNotSkippable { step_number: StepNumber },

    /// Critical steps are never skippable.
    #[error("Step {step_number} is critical and cannot be skipped")]
    CriticalStepCannotBeSkipped { step_number: StepNumber },

    /// The step requires a value and none was given.
    #[error("Step {step_number} requires input")]
    MissingInput { step_number: StepNumber },

    /// The value does not satisfy the step's input contract.
    #[error("Invalid input for step {step_number}: {reason}")]
    InvalidInput {
        step_number: StepNumber,
        reason: String,
    },

    /// Another call advanced the execution between read and persist.
    #[error(
        "Concurrent modification: expected last resolved step {}, found {}",
        describe_position(.expected),
        describe_position(.actual)
    )]
    ConcurrentModification {
        expected: Option<StepNumber>,
        actual: Option<StepNumber>,
    },

    /// The quality-check collaborator did not accept the check.
    #[error("Quality check required for step {step_number}: {reason}")]
    QualityCheckRequired {
        step_number: StepNumber,
        reason: String,
    },

    /// The execution is terminal.
    #[error("Execution {execution_id} is not in progress (status: {status})")]
    ExecutionNotInProgress {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },

    /// The execution was sealed with different terms.
    #[error("Execution {execution_id} is already sealed with a different outcome")]
    AlreadySealed { execution_id: ExecutionId },

    /// Durable storage failed or holds corrupted records.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Parse error (YAML, JSON)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error classes, in the order a caller should think about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Definition,
    Sequencing,
    Validation,
    Concurrency,
    Collaborator,
    Terminal,
    Storage,
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Definition => "definition",
            ErrorKind::Sequencing => "sequencing",
            ErrorKind::Validation => "validation",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Collaborator => "collaborator",
            ErrorKind::Terminal => "terminal",
            ErrorKind::Storage => "storage",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", s)
    }
}

impl EngineError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DefinitionNotFound(_)
            | EngineError::DefinitionNotActive { .. }
            | EngineError::InvalidDefinition(_) => ErrorKind::Definition,
            EngineError::ExecutionNotFound(_)
            | EngineError::StepNotFound { .. }
            | EngineError::StepNotEligible { .. }
            | EngineError::StepAlreadyResolved { .. }
            | EngineError::StepsRemaining { .. }
            | EngineError::InvalidBranchTarget { .. }
            | EngineError::StepNotSkippable { .. }
            | EngineError::CriticalStepCannotBeSkipped { .. } => ErrorKind::Sequencing,
            EngineError::MissingInput { .. } | EngineError::InvalidInput { .. } => {
                ErrorKind::Validation
            }
            EngineError::ConcurrentModification { .. } => ErrorKind::Concurrency,
            EngineError::QualityCheckRequired { .. } => ErrorKind::Collaborator,
            EngineError::ExecutionNotInProgress { .. } | EngineError::AlreadySealed { .. } => {
                ErrorKind::Terminal
            }
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Parse(_) | EngineError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the same call may succeed if the caller retries it,
    /// after correcting input or refetching state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Concurrency | ErrorKind::Collaborator
        )
    }
}

fn describe_position(position: &Option<StepNumber>) -> String {
    match position {
        Some(n) => n.to_string(),
        None => "none".to_string(),
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_eligible_display() {
        let err = EngineError::StepNotEligible {
            requested: 4,
            pending: Some(2),
        };
        assert_eq!(
            err.to_string(),
            "Step 4 is not eligible, pending step is 2"
        );

        let err = EngineError::StepNotEligible {
            requested: 1,
            pending: None,
        };
        assert_eq!(
            err.to_string(),
            "Step 1 is not eligible, pending step is none"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            EngineError::DefinitionNotFound("p-1".to_string()).kind(),
            ErrorKind::Definition
        );
        assert_eq!(
            EngineError::StepsRemaining { pending: 3 }.kind(),
            ErrorKind::Sequencing
        );
        assert_eq!(
            EngineError::MissingInput { step_number: 1 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::AlreadySealed {
                execution_id: ExecutionId::new()
            }
            .kind(),
            ErrorKind::Terminal
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::ConcurrentModification {
            expected: Some(1),
            actual: Some(2)
        }
        .is_retryable());
        assert!(EngineError::QualityCheckRequired {
            step_number: 2,
            reason: "lab offline".to_string()
        }
        .is_retryable());
        assert!(!EngineError::CriticalStepCannotBeSkipped { step_number: 2 }.is_retryable());
        assert!(!EngineError::Storage("disk full".to_string()).is_retryable());
    }

    #[test]
    fn test_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "journal missing");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
