//! Skip conditions and branch rules.
//!
//! Authored as flat `{field, operator, value}` objects and converted into a
//! closed [`Condition`] enum on load. `field` names a step whose recorded
//! value is read: `3`, `"3"`, `"step3"` and `"step_3"` all refer to step 3.
//! Operators that are not recognised become [`Condition::Unsupported`],
//! which never matches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::StepNumber;

/// Predicate over the recorded value of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    Equals { field: StepNumber, value: Value },
    NotEquals { field: StepNumber, value: Value },
    GreaterThan { field: StepNumber, value: f64 },
    LessThan { field: StepNumber, value: f64 },
    /// Inclusive on both ends.
    Range { field: StepNumber, min: f64, max: f64 },
    In { field: StepNumber, values: Vec<Value> },
    IsTrue { field: StepNumber },
    IsFalse { field: StepNumber },
    /// Operator, field or operand could not be understood.
    Unsupported {
        field: Option<StepNumber>,
        operator: String,
    },
}

impl Condition {
    /// The step whose value this condition reads.
    pub fn field(&self) -> Option<StepNumber> {
        match self {
            Condition::Equals { field, .. }
            | Condition::NotEquals { field, .. }
            | Condition::GreaterThan { field, .. }
            | Condition::LessThan { field, .. }
            | Condition::Range { field, .. }
            | Condition::In { field, .. }
            | Condition::IsTrue { field }
            | Condition::IsFalse { field } => Some(*field),
            Condition::Unsupported { field, .. } => *field,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Condition::Unsupported { .. })
    }

    /// Canonical operator name used on the wire.
    pub fn operator(&self) -> &str {
        match self {
            Condition::Equals { .. } => "equals",
            Condition::NotEquals { .. } => "notEquals",
            Condition::GreaterThan { .. } => "greaterThan",
            Condition::LessThan { .. } => "lessThan",
            Condition::Range { .. } => "range",
            Condition::In { .. } => "in",
            Condition::IsTrue { .. } => "isTrue",
            Condition::IsFalse { .. } => "isFalse",
            Condition::Unsupported { operator, .. } => operator,
        }
    }
}

/// Redirects the next-step pointer when its condition holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBranchRule", into = "RawBranchRule")]
pub struct BranchRule {
    pub condition: Condition,
    pub target: StepNumber,
}

/// Wire form of a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCondition {
    field: Value,
    operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawBranchRule {
    #[serde(flatten)]
    condition: RawCondition,
    target: StepNumber,
}

/// Parse a field reference into a step number.
pub fn parse_field(field: &Value) -> Option<StepNumber> {
    match field {
        Value::Number(n) => n.as_u64().and_then(|n| StepNumber::try_from(n).ok()),
        Value::String(s) => {
            let lowered = s.trim().to_lowercase();
            let digits = lowered
                .strip_prefix("step")
                .unwrap_or(&lowered)
                .trim_start_matches(['_', '-', ' ']);
            digits.parse().ok()
        }
        _ => None,
    }
}

fn normalize_operator(operator: &str) -> String {
    operator
        .trim()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .collect::<String>()
        .to_lowercase()
}

/// Numeric reading of a JSON value. Numeric strings count, non-finite values do not.
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn parse_bounds(value: &Value) -> Option<(f64, f64)> {
    match value {
        Value::Object(map) => Some((as_f64(map.get("min")?)?, as_f64(map.get("max")?)?)),
        Value::Array(items) if items.len() == 2 => Some((as_f64(&items[0])?, as_f64(&items[1])?)),
        _ => None,
    }
}

impl From<RawCondition> for Condition {
    fn from(raw: RawCondition) -> Self {
        let unsupported = |field: Option<StepNumber>| Condition::Unsupported {
            field,
            operator: raw.operator.clone(),
        };

        let Some(field) = parse_field(&raw.field) else {
            return unsupported(None);
        };
        let operand = raw.value.clone().unwrap_or(Value::Null);

        match normalize_operator(&raw.operator).as_str() {
            "equals" | "eq" | "==" | "=" => Condition::Equals {
                field,
                value: operand,
            },
            "notequals" | "ne" | "neq" | "!=" => Condition::NotEquals {
                field,
                value: operand,
            },
            "greaterthan" | "gt" | ">" => match as_f64(&operand) {
                Some(value) => Condition::GreaterThan { field, value },
                None => unsupported(Some(field)),
            },
            "lessthan" | "lt" | "<" => match as_f64(&operand) {
                Some(value) => Condition::LessThan { field, value },
                None => unsupported(Some(field)),
            },
            "range" | "between" => match parse_bounds(&operand) {
                Some((min, max)) => Condition::Range { field, min, max },
                None => unsupported(Some(field)),
            },
            "in" | "oneof" => match operand {
                Value::Array(values) => Condition::In { field, values },
                _ => unsupported(Some(field)),
            },
            "istrue" | "true" => Condition::IsTrue { field },
            "isfalse" | "false" => Condition::IsFalse { field },
            _ => unsupported(Some(field)),
        }
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        let operator = condition.operator().to_string();
        let (field, value) = match condition {
            Condition::Equals { field, value } | Condition::NotEquals { field, value } => {
                (Some(field), Some(value))
            }
            Condition::GreaterThan { field, value } | Condition::LessThan { field, value } => {
                (Some(field), Some(serde_json::json!(value)))
            }
            Condition::Range { field, min, max } => {
                (Some(field), Some(serde_json::json!({"min": min, "max": max})))
            }
            Condition::In { field, values } => (Some(field), Some(Value::Array(values))),
            Condition::IsTrue { field } | Condition::IsFalse { field } => (Some(field), None),
            Condition::Unsupported { field, .. } => (field, None),
        };
        RawCondition {
            field: field.map(Value::from).unwrap_or(Value::Null),
            operator,
            value,
        }
    }
}

impl From<RawBranchRule> for BranchRule {
    fn from(raw: RawBranchRule) -> Self {
        BranchRule {
            condition: raw.condition.into(),
            target: raw.target,
        }
    }
}

impl From<BranchRule> for RawBranchRule {
    fn from(rule: BranchRule) -> Self {
        RawBranchRule {
            condition: rule.condition.into(),
            target: rule.target,
        }
    }
}
