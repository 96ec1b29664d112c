//! Procedure definition parser.
//!
//! Parses YAML or JSON procedure definitions and validates the structural
//! rules the engine relies on:
//! - unique, non-zero step numbers
//! - critical and optional are mutually exclusive
//! - branch targets exist and point strictly forward
//! - conditions only read values that can already be recorded
//! - input rules are internally consistent

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::procedure::types::{ProcedureDefinition, StepDefinition};

/// Parse a YAML string into a validated definition.
pub fn parse_definition(yaml_content: &str) -> EngineResult<ProcedureDefinition> {
    let mut definition: ProcedureDefinition = serde_yaml::from_str(yaml_content)?;
    definition.sort_steps();
    validate_definition(&definition)?;
    Ok(definition)
}

/// Parse a JSON string into a validated definition.
pub fn parse_definition_json(json_content: &str) -> EngineResult<ProcedureDefinition> {
    let mut definition: ProcedureDefinition = serde_json::from_str(json_content)?;
    definition.sort_steps();
    validate_definition(&definition)?;
    Ok(definition)
}

/// Read and parse a definition file, choosing the format by extension.
pub fn parse_definition_file(path: &Path) -> EngineResult<ProcedureDefinition> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Parse(format!("{}: {}", path.display(), e)))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_definition_json(&content),
        _ => parse_definition(&content),
    }
}

/// Validate a parsed definition.
pub fn validate_definition(definition: &ProcedureDefinition) -> EngineResult<()> {
    if definition.id.trim().is_empty() {
        return Err(EngineError::InvalidDefinition(
            "Procedure id must not be empty".to_string(),
        ));
    }

    if definition.steps.is_empty() {
        return Err(EngineError::InvalidDefinition(format!(
            "Procedure '{}' has no steps",
            definition.id
        )));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if step.step_number == 0 {
            return Err(EngineError::InvalidDefinition(format!(
                "Step '{}': step numbers start at 1",
                step.title
            )));
        }
        if !seen.insert(step.step_number) {
            return Err(EngineError::InvalidDefinition(format!(
                "Duplicate step number: {}",
                step.step_number
            )));
        }
    }

    for step in &definition.steps {
        validate_step(definition, step)?;
    }

    Ok(())
}

fn validate_step(definition: &ProcedureDefinition, step: &StepDefinition) -> EngineResult<()> {
    let n = step.step_number;
    let invalid = |msg: String| EngineError::InvalidDefinition(format!("Step {}: {}", n, msg));

    if let Some(owner) = &step.procedure_id {
        if owner != &definition.id {
            return Err(invalid(format!(
                "belongs to procedure '{}', not '{}'",
                owner, definition.id
            )));
        }
    }

    if step.is_critical && step.is_optional {
        return Err(invalid("cannot be both critical and optional".to_string()));
    }

    if step.input_required && step.input_type.is_none() {
        return Err(invalid("requires input but declares no inputType".to_string()));
    }

    if let Some(range) = &step.acceptable_range {
        if range.min > range.max {
            return Err(invalid(format!(
                "acceptableRange min {} exceeds max {}",
                range.min, range.max
            )));
        }
    }

    let rules = &step.input_validation;
    if let (Some(min), Some(max)) = (rules.min, rules.max) {
        if min > max {
            return Err(invalid(format!("inputValidation min {} exceeds max {}", min, max)));
        }
    }
    if let (Some(min), Some(max)) = (rules.min_length, rules.max_length) {
        if min > max {
            return Err(invalid(format!(
                "inputValidation minLength {} exceeds maxLength {}",
                min, max
            )));
        }
    }
    if let Some(pattern) = &rules.pattern {
        Regex::new(pattern).map_err(|e| invalid(format!("invalid pattern: {}", e)))?;
    }

    if step.is_critical && !step.skip_conditions.is_empty() {
        warn!(
            procedure_id = %definition.id,
            step_number = n,
            "Critical step carries skip conditions, they will be ignored"
        );
    }

    for condition in &step.skip_conditions {
        if let Some(field) = condition.field() {
            if field >= n {
                return Err(invalid(format!(
                    "skip condition reads step {} which is not recorded before this step",
                    field
                )));
            }
        }
        if !condition.is_supported() {
            warn!(
                procedure_id = %definition.id,
                step_number = n,
                operator = %condition.operator(),
                "Unsupported skip condition will never match"
            );
        }
    }

    for rule in &step.conditional_logic {
        if rule.target <= n || definition.step(rule.target).is_none() {
            return Err(EngineError::InvalidBranchTarget {
                from: n,
                target: rule.target,
            });
        }
        if let Some(field) = rule.condition.field() {
            if field > n {
                return Err(invalid(format!(
                    "branch rule reads step {} which is not recorded yet",
                    field
                )));
            }
        }
        if !rule.condition.is_supported() {
            warn!(
                procedure_id = %definition.id,
                step_number = n,
                operator = %rule.condition.operator(),
                "Unsupported branch condition will never match"
            );
        }
    }

    Ok(())
}
