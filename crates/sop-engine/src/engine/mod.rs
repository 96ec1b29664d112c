//! Procedure execution engine.
//!
//! This module provides the core execution engine:
//!
//! - **Validator**: Checks submitted values against a step's input contract
//! - **Evaluator**: Evaluates skip conditions and branch rules
//! - **Planner**: Derives the next eligible step
//! - **State**: Reconstructs executions from recorded history
//! - **State machine**: Owns the execution lifecycle

pub mod evaluator;
pub mod planner;
pub mod state;
pub mod state_machine;
pub mod validator;

pub use evaluator::ConditionEvaluator;
pub use planner::{ExecutionPlanner, Plan};
pub use state::{
    ExecutionContext, ExecutionStatus, ExecutionView, Outcome, ProcedureExecution, Progress,
    StepOutcome,
};
pub use state_machine::ExecutionStateMachine;
pub use validator::{StepValidator, ValidationResult};
