//! Condition evaluation for skip decisions and branching.
//!
//! Every predicate fails closed: a missing or null field, a value of the
//! wrong shape, or an unsupported operator evaluates to `false`.

use serde_json::Value;

use crate::engine::state::ExecutionContext;
use crate::procedure::condition::as_f64;
use crate::procedure::{BranchRule, Condition, StepNumber};

/// Evaluates conditions against recorded step values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a single condition.
    pub fn evaluate_condition(&self, condition: &Condition, context: &ExecutionContext) -> bool {
        let Some(field) = condition.field() else {
            return false;
        };
        let actual = match context.get(&field) {
            Some(Value::Null) | None => return false,
            Some(value) => value,
        };

        match condition {
            Condition::Equals { value, .. } => values_equal(actual, value),
            Condition::NotEquals { value, .. } => !values_equal(actual, value),
            Condition::GreaterThan { value, .. } => as_f64(actual).is_some_and(|a| a > *value),
            Condition::LessThan { value, .. } => as_f64(actual).is_some_and(|a| a < *value),
            Condition::Range { min, max, .. } => {
                as_f64(actual).is_some_and(|a| a >= *min && a <= *max)
            }
            Condition::In { values, .. } => values.iter().any(|v| values_equal(actual, v)),
            Condition::IsTrue { .. } => truthiness(actual) == Some(true),
            Condition::IsFalse { .. } => truthiness(actual) == Some(false),
            Condition::Unsupported { .. } => false,
        }
    }

    /// True when any condition holds. An empty list never holds.
    pub fn evaluate(&self, conditions: &[Condition], context: &ExecutionContext) -> bool {
        conditions
            .iter()
            .any(|condition| self.evaluate_condition(condition, context))
    }

    /// Target of the first rule whose condition holds.
    pub fn resolve_branch(
        &self,
        rules: &[BranchRule],
        context: &ExecutionContext,
    ) -> Option<StepNumber> {
        rules
            .iter()
            .find(|rule| self.evaluate_condition(&rule.condition, context))
            .map(|rule| rule.target)
    }
}

/// Equality that treats `5`, `5.0` and `"5"` as the same value.
fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_f64(actual), as_f64(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            parse_bool(s) == Some(*b)
        }
        _ => false,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Boolean reading of a recorded value. `None` when it has none.
fn truthiness(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(_) => as_f64(value).map(|n| n != 0.0),
        Value::String(s) => parse_bool(s),
        _ => None,
    }
}
