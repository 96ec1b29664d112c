//! Procedure definition types.
//!
//! Complete type definitions for authored procedures:
//! - ordered steps keyed by `stepNumber`
//! - closed step and input type enums
//! - typed input validation and acceptable ranges
//! - skip conditions and branch rules (see [`super::condition`])
//!
//! Wire names are camelCase (`stepNumber`, `isCritical`), enum values are
//! snake_case (`safety_check`).

use serde::{Deserialize, Serialize};

use super::condition::{BranchRule, Condition};

/// Procedure identifier as assigned by the definitions store.
pub type ProcedureId = String;

/// Position of a step within its procedure.
pub type StepNumber = u32;

/// Lifecycle status of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Archived,
}

impl std::fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DefinitionStatus::Draft => "draft",
            DefinitionStatus::Active => "active",
            DefinitionStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// Kind of work a step asks of the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Decision,
    Inspection,
    Measurement,
    Wait,
    SafetyCheck,
    Note,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepType::Action => "action",
            StepType::Decision => "decision",
            StepType::Inspection => "inspection",
            StepType::Measurement => "measurement",
            StepType::Wait => "wait",
            StepType::SafetyCheck => "safety_check",
            StepType::Note => "note",
        };
        write!(f, "{}", s)
    }
}

/// Shape of the value an operator submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Text,
    Number,
    Checkbox,
    Photo,
    Signature,
    Measurement,
    Time,
    Date,
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InputType::Text => "text",
            InputType::Number => "number",
            InputType::Checkbox => "checkbox",
            InputType::Photo => "photo",
            InputType::Signature => "signature",
            InputType::Measurement => "measurement",
            InputType::Time => "time",
            InputType::Date => "date",
        };
        write!(f, "{}", s)
    }
}

/// Type-specific validation rules. Fields that do not apply to the step's
/// input type are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValidation {
    /// Lower bound for number/measurement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Upper bound for number/measurement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Regular expression text must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Allowed text values (decision steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,

    /// Photo/signature need a reference token; a checkbox must be ticked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl InputValidation {
    pub fn is_empty(&self) -> bool {
        self == &InputValidation::default()
    }
}

/// Deviation bounds for a measured value. Inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptableRange {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl AcceptableRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl std::fmt::Display for AcceptableRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "[{}, {}] {}", self.min, self.max, unit),
            None => write!(f, "[{}, {}]", self.min, self.max),
        }
    }
}

/// Equipment and materials an operator should have at hand before
/// starting a step. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preconditions {
    pub required_equipment: Vec<String>,
    pub required_materials: Vec<String>,
}

impl Preconditions {
    pub fn is_empty(&self) -> bool {
        self.required_equipment.is_empty() && self.required_materials.is_empty()
    }
}

/// One step of a procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure_id: Option<ProcedureId>,

    pub step_number: StepNumber,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub step_type: StepType,

    #[serde(default)]
    pub is_critical: bool,

    #[serde(default)]
    pub is_optional: bool,

    /// Any match makes the step skip-eligible. Ignored for critical steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_conditions: Vec<Condition>,

    /// First match wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_logic: Vec<BranchRule>,

    #[serde(default)]
    pub input_required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<InputType>,

    #[serde(default, skip_serializing_if = "InputValidation::is_empty")]
    pub input_validation: InputValidation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptable_range: Option<AcceptableRange>,

    #[serde(default)]
    pub quality_check_required: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_equipment: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_materials: Vec<String>,
}

impl StepDefinition {
    /// Create a plain action step with no input.
    pub fn new(step_number: StepNumber, title: &str, step_type: StepType) -> Self {
        Self {
            id: None,
            procedure_id: None,
            step_number,
            title: title.to_string(),
            description: None,
            step_type,
            is_critical: false,
            is_optional: false,
            skip_conditions: Vec::new(),
            conditional_logic: Vec::new(),
            input_required: false,
            input_type: None,
            input_validation: InputValidation::default(),
            acceptable_range: None,
            quality_check_required: false,
            required_equipment: Vec::new(),
            required_materials: Vec::new(),
        }
    }

    /// Whether a numeric reading on this step is checked against
    /// `acceptableRange`.
    pub fn tracks_deviation(&self) -> bool {
        self.acceptable_range.is_some()
            && (matches!(
                self.step_type,
                StepType::Measurement | StepType::Inspection | StepType::SafetyCheck
            ) || self.input_type == Some(InputType::Measurement))
    }

    /// A deviation on this step fails the whole execution.
    pub fn deviation_blocks_success(&self) -> bool {
        self.is_critical && self.step_type == StepType::SafetyCheck
    }

    pub fn preconditions(&self) -> Preconditions {
        Preconditions {
            required_equipment: self.required_equipment.clone(),
            required_materials: self.required_materials.clone(),
        }
    }
}

fn default_version() -> u32 {
    1
}

/// An authored procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureDefinition {
    pub id: ProcedureId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default = "default_version")]
    pub version: u32,

    pub status: DefinitionStatus,

    pub steps: Vec<StepDefinition>,
}

impl ProcedureDefinition {
    /// Create a new definition. Steps are kept in ascending order.
    pub fn new(id: &str, status: DefinitionStatus, steps: Vec<StepDefinition>) -> Self {
        let mut definition = Self {
            id: id.to_string(),
            name: None,
            version: default_version(),
            status,
            steps,
        };
        definition.sort_steps();
        definition
    }

    pub fn sort_steps(&mut self) {
        self.steps.sort_by_key(|s| s.step_number);
    }

    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }

    /// Get a step by number.
    pub fn step(&self, step_number: StepNumber) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// The lowest-numbered step.
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.iter().min_by_key(|s| s.step_number)
    }

    /// Steps numbered at or above `step_number`, ascending.
    pub fn steps_from(&self, step_number: StepNumber) -> impl Iterator<Item = &StepDefinition> {
        self.steps
            .iter()
            .filter(move |s| s.step_number >= step_number)
    }

    /// The next-highest step after `step_number`.
    pub fn successor(&self, step_number: StepNumber) -> Option<&StepDefinition> {
        self.steps
            .iter()
            .filter(|s| s.step_number > step_number)
            .min_by_key(|s| s.step_number)
    }

    pub fn critical_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps.iter().filter(|s| s.is_critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_from_yaml_defaults() {
        let yaml = r#"
stepNumber: 2
title: Check tank pressure
stepType: safety_check
isCritical: true
inputRequired: true
inputType: measurement
acceptableRange: {min: 10, max: 20, unit: psi}
requiredEquipment: [gauge]
"#;
        let step: StepDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.step_type, StepType::SafetyCheck);
        assert!(step.is_critical);
        assert!(!step.is_optional);
        assert!(step.skip_conditions.is_empty());
        assert_eq!(step.input_type, Some(InputType::Measurement));
        assert!(step.tracks_deviation());
        assert!(step.deviation_blocks_success());
        assert_eq!(step.preconditions().required_equipment, vec!["gauge"]);
    }

    #[test]
    fn test_tracks_deviation_needs_range() {
        let mut step = StepDefinition::new(1, "Read thermometer", StepType::Measurement);
        assert!(!step.tracks_deviation());
        step.acceptable_range = Some(AcceptableRange {
            min: 2.0,
            max: 8.0,
            unit: Some("C".to_string()),
        });
        assert!(step.tracks_deviation());

        let mut note = StepDefinition::new(2, "Note", StepType::Note);
        note.acceptable_range = step.acceptable_range.clone();
        assert!(!note.tracks_deviation());
    }

    #[test]
    fn test_definition_orders_steps() {
        let definition = ProcedureDefinition::new(
            "sop-1",
            DefinitionStatus::Active,
            vec![
                StepDefinition::new(3, "Three", StepType::Action),
                StepDefinition::new(1, "One", StepType::Action),
                StepDefinition::new(2, "Two", StepType::Action),
            ],
        );
        let numbers: Vec<_> = definition.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(definition.first_step().map(|s| s.step_number), Some(1));
        assert_eq!(definition.successor(1).map(|s| s.step_number), Some(2));
        assert!(definition.successor(3).is_none());
        assert_eq!(definition.steps_from(2).count(), 2);
    }

    #[test]
    fn test_acceptable_range_display() {
        let range = AcceptableRange {
            min: 10.0,
            max: 20.0,
            unit: Some("psi".to_string()),
        };
        assert_eq!(range.to_string(), "[10, 20] psi");
        assert!(range.contains(10.0));
        assert!(!range.contains(20.5));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DefinitionStatus::Active.to_string(), "active");
        assert_eq!(StepType::SafetyCheck.to_string(), "safety_check");
        assert_eq!(InputType::Signature.to_string(), "signature");
    }
}
