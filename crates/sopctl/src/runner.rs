//! Local procedure runner.
//!
//! Drives one execution of a procedure file from a scripted responses file:
//!
//! ```yaml
//! operator: op-17
//! responses:
//!   1: {value: done}
//!   2: {value: 14.2}
//!   3: {skip: true}
//! ```
//!
//! Steps without a response are submitted with no value when they take no
//! input. A step that requires input and has no response stops the run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sop_engine::collaborators::{RecordingQualityChecks, TracingNotifier};
use sop_engine::procedure::{parse_definition_file, StepNumber};
use sop_engine::{
    ExecutionRecorder, ExecutionStateMachine, InMemoryDefinitionStore, InMemoryRecorder, Outcome,
    ProcedureExecution,
};
use tracing::{debug, info};

/// Scripted operator input for one run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Responses {
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub responses: BTreeMap<StepNumber, StepResponse>,
}

/// What the operator does at one step.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepResponse {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub skip: bool,
}

impl Responses {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read responses file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse responses file: {}", path.display()))
    }
}

/// Runs a procedure file end to end.
pub struct ProcedureRunner {
    definition_path: PathBuf,
    responses: Responses,
    operator: Option<String>,
    outcome: Outcome,
    recorder: Arc<dyn ExecutionRecorder>,
}

impl ProcedureRunner {
    pub fn new(definition_path: PathBuf, responses: Responses) -> Self {
        Self {
            definition_path,
            responses,
            operator: None,
            outcome: Outcome::Success,
            recorder: Arc::new(InMemoryRecorder::new()),
        }
    }

    /// Operator id, overriding the one in the responses file.
    pub fn with_operator(mut self, operator: Option<String>) -> Self {
        if operator.is_some() {
            self.operator = operator;
        }
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    fn operator(&self) -> &str {
        self.operator
            .as_deref()
            .or(self.responses.operator.as_deref())
            .unwrap_or("sopctl")
    }

    pub fn run(&self) -> Result<ProcedureExecution> {
        let definition = parse_definition_file(&self.definition_path).with_context(|| {
            format!("Failed to load procedure: {}", self.definition_path.display())
        })?;
        let procedure_id = definition.id.clone();

        let definitions = Arc::new(InMemoryDefinitionStore::new());
        definitions.register(definition)?;

        let engine = ExecutionStateMachine::new(definitions, self.recorder.clone())
            .with_quality_checks(Arc::new(RecordingQualityChecks::new()))
            .with_notifier(Arc::new(TracingNotifier));

        let operator = self.operator();
        let execution = engine.start(&procedure_id, operator)?;
        info!(execution_id = %execution.id, procedure_id = %procedure_id, "Running procedure");

        while let Some(step) = engine.next_step(&execution.id, operator)? {
            let n = step.step_number;
            match self.responses.responses.get(&n) {
                Some(response) if response.skip => {
                    debug!(step_number = n, "Skipping step");
                    engine
                        .skip_step(&execution.id, n, operator)
                        .with_context(|| {
                            format!("Step {} ({}) could not be skipped", n, step.title)
                        })?;
                }
                Some(response) => {
                    engine
                        .submit_step(&execution.id, n, response.value.clone(), operator)
                        .with_context(|| format!("Step {} ({}) was rejected", n, step.title))?;
                }
                None if !step.input_required => {
                    engine
                        .submit_step(&execution.id, n, None, operator)
                        .with_context(|| format!("Step {} ({}) was rejected", n, step.title))?;
                }
                None => bail!(
                    "No response for step {} ({}), which requires input",
                    n,
                    step.title
                ),
            }
        }

        Ok(engine.finalize(&execution.id, self.outcome, operator)?)
    }
}
