//! In-memory recorder.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::procedure::StepNumber;

use super::log::ExecutionLog;
use super::models::{ExecutionHeader, ExecutionRecord, ExecutionSeal, StepCompletion};
use super::{ExecutionId, ExecutionRecorder};

/// Recorder that keeps every execution in process memory.
///
/// Each execution has its own lock, so appends to different executions
/// never contend.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    executions: RwLock<HashMap<ExecutionId, Arc<RwLock<ExecutionLog>>>>,
}

fn poisoned() -> EngineError {
    EngineError::Storage("recorder lock poisoned".to_string())
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, execution_id: &ExecutionId) -> EngineResult<Arc<RwLock<ExecutionLog>>> {
        let executions = self.executions.read().map_err(|_| poisoned())?;
        executions
            .get(execution_id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(*execution_id))
    }
}

impl ExecutionRecorder for InMemoryRecorder {
    fn open(&self, header: ExecutionHeader) -> EngineResult<()> {
        let mut executions = self.executions.write().map_err(|_| poisoned())?;
        if executions.contains_key(&header.execution_id) {
            return Err(EngineError::Storage(format!(
                "execution {} already exists",
                header.execution_id
            )));
        }
        let execution_id = header.execution_id;
        executions.insert(execution_id, Arc::new(RwLock::new(ExecutionLog::new(header))));
        debug!(execution_id = %execution_id, "Opened execution");
        Ok(())
    }

    fn append(
        &self,
        completion: StepCompletion,
        expected_last: Option<StepNumber>,
    ) -> EngineResult<()> {
        let log = self.log(&completion.execution_id)?;
        let mut log = log.write().map_err(|_| poisoned())?;
        log.append(completion, expected_last)
    }

    fn seal(&self, seal: ExecutionSeal) -> EngineResult<ExecutionSeal> {
        let log = self.log(&seal.execution_id)?;
        let mut log = log.write().map_err(|_| poisoned())?;
        let (seal, _) = log.apply_seal(seal)?;
        Ok(seal)
    }

    fn records(&self, execution_id: &ExecutionId) -> EngineResult<Vec<ExecutionRecord>> {
        let log = self.log(execution_id)?;
        let log = log.read().map_err(|_| poisoned())?;
        Ok(log.records())
    }

    fn execution_ids(&self) -> EngineResult<Vec<ExecutionId>> {
        let executions = self.executions.read().map_err(|_| poisoned())?;
        let mut ids: Vec<_> = executions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{DefinitionStatus, ProcedureDefinition, StepDefinition, StepType};
    use chrono::Utc;

    fn header() -> ExecutionHeader {
        ExecutionHeader {
            execution_id: ExecutionId::new(),
            procedure_id: "p".to_string(),
            procedure_version: 1,
            operator_id: "op".to_string(),
            started_at: Utc::now(),
            definition: ProcedureDefinition::new(
                "p",
                DefinitionStatus::Active,
                vec![StepDefinition::new(1, "One", StepType::Action)],
            ),
        }
    }

    #[test]
    fn test_open_and_append() {
        let recorder = InMemoryRecorder::new();
        let header = header();
        let id = header.execution_id;
        recorder.open(header.clone()).unwrap();
        assert!(recorder.open(header).is_err());

        recorder
            .append(StepCompletion::completed(id, 1, None, false, "op"), None)
            .unwrap();
        let records = recorder.records(&id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(recorder.execution_ids().unwrap(), vec![id]);
    }

    #[test]
    fn test_unknown_execution() {
        let recorder = InMemoryRecorder::new();
        let id = ExecutionId::new();
        assert!(matches!(
            recorder.records(&id),
            Err(EngineError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            recorder.append(StepCompletion::completed(id, 1, None, false, "op"), None),
            Err(EngineError::ExecutionNotFound(_))
        ));
    }
}
