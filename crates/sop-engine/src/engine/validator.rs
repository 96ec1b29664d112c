//! Step input validation.
//!
//! Each [`InputType`] maps to one rule function through [`rule_for`]. A
//! rule either rejects the value with a reason or accepts it, returning the
//! numeric reading used for deviation checks. Deviation never fails
//! validation.

use chrono::{DateTime, NaiveDate, NaiveTime};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::procedure::condition::as_f64;
use crate::procedure::{InputType, StepDefinition};

/// Result of validating one submitted value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidationResult {
    /// The reading fell outside the step's acceptable range.
    pub is_deviation: bool,
    /// Numeric reading of the value, if it has one.
    pub measured: Option<f64>,
}

impl ValidationResult {
    fn accepted(measured: Option<f64>) -> Self {
        Self {
            is_deviation: false,
            measured,
        }
    }
}

type Rule = fn(&StepDefinition, &Value) -> Result<Option<f64>, String>;

fn rule_for(input_type: InputType) -> Rule {
    match input_type {
        InputType::Number | InputType::Measurement => validate_number,
        InputType::Text => validate_text,
        InputType::Checkbox => validate_checkbox,
        InputType::Date => validate_date,
        InputType::Time => validate_time,
        InputType::Photo | InputType::Signature => validate_reference,
    }
}

/// Validates submitted values against a step's input contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepValidator;

impl StepValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        step: &StepDefinition,
        value: Option<&Value>,
    ) -> EngineResult<ValidationResult> {
        let value = value.filter(|v| !v.is_null());
        let step_number = step.step_number;

        // `inputValidation.required` makes a value mandatory even when the
        // step itself does not demand input.
        let required = step.input_required || step.input_validation.required == Some(true);

        let Some(value) = value else {
            if required {
                return Err(EngineError::MissingInput { step_number });
            }
            return Ok(ValidationResult::accepted(None));
        };

        if required && matches!(value, Value::String(s) if s.trim().is_empty()) {
            return Err(EngineError::MissingInput { step_number });
        }

        let measured = match step.input_type {
            Some(input_type) => rule_for(input_type)(step, value)
                .map_err(|reason| EngineError::InvalidInput { step_number, reason })?,
            None => as_f64(value),
        };

        let is_deviation = match (&step.acceptable_range, measured) {
            (Some(range), Some(reading)) if step.tracks_deviation() => !range.contains(reading),
            _ => false,
        };

        Ok(ValidationResult {
            is_deviation,
            measured,
        })
    }
}

fn validate_number(step: &StepDefinition, value: &Value) -> Result<Option<f64>, String> {
    let reading = match value {
        Value::Number(_) | Value::String(_) => as_f64(value),
        _ => None,
    }
    .ok_or_else(|| format!("expected a finite number, got {}", value))?;

    let rules = &step.input_validation;
    if let Some(min) = rules.min {
        if reading < min {
            return Err(format!("{} is below the minimum of {}", reading, min));
        }
    }
    if let Some(max) = rules.max {
        if reading > max {
            return Err(format!("{} is above the maximum of {}", reading, max));
        }
    }
    Ok(Some(reading))
}

fn validate_text(step: &StepDefinition, value: &Value) -> Result<Option<f64>, String> {
    let Value::String(text) = value else {
        return Err(format!("expected text, got {}", value));
    };

    let rules = &step.input_validation;
    let length = text.chars().count();
    if let Some(min) = rules.min_length {
        if length < min {
            return Err(format!("must be at least {} characters", min));
        }
    }
    if let Some(max) = rules.max_length {
        if length > max {
            return Err(format!("must be at most {} characters", max));
        }
    }
    if let Some(pattern) = &rules.pattern {
        let regex = Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;
        if !regex.is_match(text) {
            return Err(format!("does not match pattern {}", pattern));
        }
    }
    if let Some(options) = &rules.options {
        if !options.iter().any(|o| o == text) {
            return Err(format!("must be one of: {}", options.join(", ")));
        }
    }
    Ok(as_f64(value))
}

fn validate_checkbox(step: &StepDefinition, value: &Value) -> Result<Option<f64>, String> {
    let Value::Bool(checked) = value else {
        return Err(format!("expected true or false, got {}", value));
    };
    if step.input_validation.required == Some(true) && !checked {
        return Err("must be checked".to_string());
    }
    Ok(None)
}

fn validate_date(_step: &StepDefinition, value: &Value) -> Result<Option<f64>, String> {
    let Value::String(text) = value else {
        return Err(format!("expected an ISO date, got {}", value));
    };
    let text = text.trim();
    if NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        || DateTime::parse_from_rfc3339(text).is_ok()
    {
        return Ok(None);
    }
    Err(format!("'{}' is not an ISO date", text))
}

fn validate_time(_step: &StepDefinition, value: &Value) -> Result<Option<f64>, String> {
    let Value::String(text) = value else {
        return Err(format!("expected an ISO time, got {}", value));
    };
    let text = text.trim();
    let is_time = ["%H:%M:%S", "%H:%M:%S%.f", "%H:%M"]
        .iter()
        .any(|format| NaiveTime::parse_from_str(text, format).is_ok());
    if is_time || DateTime::parse_from_rfc3339(text).is_ok() {
        return Ok(None);
    }
    Err(format!("'{}' is not an ISO time", text))
}

/// Photos and signatures are stored elsewhere; the step records a reference.
fn validate_reference(_step: &StepDefinition, value: &Value) -> Result<Option<f64>, String> {
    match value {
        Value::String(token) if !token.trim().is_empty() => Ok(None),
        Value::String(_) => Err("reference must not be empty".to_string()),
        other => Err(format!("expected a reference token, got {}", other)),
    }
}
