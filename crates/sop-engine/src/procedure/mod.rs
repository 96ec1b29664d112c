//! Procedure definitions.
//!
//! This module provides the authored side of the engine:
//! - Type definitions for procedures and steps
//! - Skip conditions and branch rules
//! - YAML/JSON parsing and validation
//! - The definitions store

pub mod condition;
pub mod parser;
pub mod store;
pub mod types;

pub use condition::{parse_field, BranchRule, Condition};
pub use parser::{
    parse_definition, parse_definition_file, parse_definition_json, validate_definition,
};
pub use store::{DefinitionStore, InMemoryDefinitionStore};
pub use types::{
    AcceptableRange, DefinitionStatus, InputType, InputValidation, Preconditions,
    ProcedureDefinition, ProcedureId, StepDefinition, StepNumber, StepType,
};
