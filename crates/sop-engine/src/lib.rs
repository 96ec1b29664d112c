//! SOP Execution Engine
//!
//! This crate runs standard operating procedures step by step on behalf of
//! operators:
//!
//! - **Procedures**: Parse, validate and store authored definitions
//! - **Planning**: Derive the next eligible step, applying skip conditions
//!   and branch rules
//! - **Validation**: Check submitted values and flag deviations
//! - **Lifecycle**: Gate critical steps and decide the terminal outcome
//! - **Recording**: Append-only execution history, in memory or journaled
//!
//! ## Architecture
//!
//! Executions are event-sourced. The recorder holds an append-only list of
//! records per execution and every operation rebuilds the execution from
//! them. Appends carry the last resolved step the caller saw, so concurrent
//! mutations of one execution are detected rather than merged.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`procedure`]: Definitions, conditions, parsing and the definitions store
//! - [`engine`]: Validator, evaluator, planner and state machine
//! - [`recorder`]: Execution records and recorder implementations
//! - [`collaborators`]: Quality-check and notification interfaces
//! - [`error`]: Error types
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sop_engine::{
//!     ExecutionStateMachine, InMemoryDefinitionStore, InMemoryRecorder, Outcome,
//! };
//!
//! let definitions = Arc::new(InMemoryDefinitionStore::new());
//! definitions.register(sop_engine::procedure::parse_definition(yaml)?)?;
//!
//! let engine = ExecutionStateMachine::new(definitions, Arc::new(InMemoryRecorder::new()));
//! let execution = engine.start("tank-check", "op-17")?;
//! engine.submit_step(&execution.id, 1, Some(serde_json::json!(true)), "op-17")?;
//! let sealed = engine.finalize(&execution.id, Outcome::Success, "op-17")?;
//! ```

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod procedure;
pub mod recorder;
pub mod result_ext;

pub use collaborators::{CollaboratorError, Notification, Notifier, QualityCheckSink};
pub use config::{EngineConfig, LogFormat};
pub use engine::{
    ExecutionStateMachine, ExecutionStatus, ExecutionView, Outcome, ProcedureExecution,
    StepOutcome,
};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use procedure::{DefinitionStore, InMemoryDefinitionStore, ProcedureDefinition, StepDefinition};
pub use recorder::{ExecutionId, ExecutionRecorder, InMemoryRecorder, JournalRecorder};
pub use result_ext::ResultExt;
