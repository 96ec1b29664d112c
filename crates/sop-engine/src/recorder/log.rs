//! In-memory record log for one execution.
//!
//! Both recorders keep one [`ExecutionLog`] per execution and apply the same
//! append rules, so the journal can never accept a record the in-memory
//! recorder would refuse.

use crate::error::{EngineError, EngineResult};
use crate::procedure::StepNumber;

use super::models::{ExecutionHeader, ExecutionRecord, ExecutionSeal, StepCompletion};
use super::ExecutionId;

#[derive(Debug, Clone)]
pub struct ExecutionLog {
    header: ExecutionHeader,
    completions: Vec<StepCompletion>,
    seal: Option<ExecutionSeal>,
}

impl ExecutionLog {
    pub fn new(header: ExecutionHeader) -> Self {
        Self {
            header,
            completions: Vec::new(),
            seal: None,
        }
    }

    /// Rebuild a log from stored records, re-checking every append rule.
    pub fn from_records(records: Vec<ExecutionRecord>) -> EngineResult<Self> {
        let mut records = records.into_iter();
        let mut log = match records.next() {
            Some(ExecutionRecord::Opened(header)) => Self::new(header),
            Some(_) => {
                return Err(EngineError::Storage(
                    "execution history does not start with an opened record".to_string(),
                ))
            }
            None => return Err(EngineError::Storage("empty execution history".to_string())),
        };

        for record in records {
            match record {
                ExecutionRecord::Opened(header) => {
                    return Err(EngineError::Storage(format!(
                        "execution {} opened twice",
                        header.execution_id
                    )))
                }
                ExecutionRecord::Step(completion) => {
                    let expected = log.last_step();
                    log.check_append(&completion, expected)?;
                    log.completions.push(completion);
                }
                ExecutionRecord::Sealed(seal) => {
                    log.check_seal(&seal)?;
                    log.seal = Some(seal);
                }
            }
        }
        Ok(log)
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.header.execution_id
    }

    pub fn header(&self) -> &ExecutionHeader {
        &self.header
    }

    pub fn seal(&self) -> Option<&ExecutionSeal> {
        self.seal.as_ref()
    }

    pub fn last_step(&self) -> Option<StepNumber> {
        self.completions.last().map(|c| c.step_number)
    }

    /// Check a step record against the log without applying it.
    pub fn check_append(
        &self,
        completion: &StepCompletion,
        expected_last: Option<StepNumber>,
    ) -> EngineResult<()> {
        if let Some(seal) = &self.seal {
            return Err(EngineError::ExecutionNotInProgress {
                execution_id: seal.execution_id,
                status: seal.status,
            });
        }

        if completion.execution_id != self.header.execution_id {
            return Err(EngineError::Storage(format!(
                "record for execution {} appended to execution {}",
                completion.execution_id, self.header.execution_id
            )));
        }

        let actual = self.last_step();
        if actual != expected_last {
            return Err(EngineError::ConcurrentModification {
                expected: expected_last,
                actual,
            });
        }

        let step_number = completion.step_number;
        if self.completions.iter().any(|c| c.step_number == step_number) {
            return Err(EngineError::StepAlreadyResolved { step_number });
        }

        if let Some(last) = actual {
            if step_number < last {
                return Err(EngineError::StepNotEligible {
                    requested: step_number,
                    pending: None,
                });
            }
        }

        Ok(())
    }

    pub fn append(
        &mut self,
        completion: StepCompletion,
        expected_last: Option<StepNumber>,
    ) -> EngineResult<()> {
        self.check_append(&completion, expected_last)?;
        self.completions.push(completion);
        Ok(())
    }

    /// Check a seal. `Ok(Some(existing))` means the same seal is already
    /// recorded and nothing should be written.
    pub fn check_seal(&self, seal: &ExecutionSeal) -> EngineResult<Option<ExecutionSeal>> {
        if seal.execution_id != self.header.execution_id {
            return Err(EngineError::Storage(format!(
                "seal for execution {} applied to execution {}",
                seal.execution_id, self.header.execution_id
            )));
        }
        match &self.seal {
            Some(existing) if existing.same_terms(seal) => Ok(Some(existing.clone())),
            Some(_) => Err(EngineError::AlreadySealed {
                execution_id: self.header.execution_id,
            }),
            None => Ok(None),
        }
    }

    /// Seal the log, returning the seal now in force and whether it is new.
    pub fn apply_seal(&mut self, seal: ExecutionSeal) -> EngineResult<(ExecutionSeal, bool)> {
        if let Some(existing) = self.check_seal(&seal)? {
            return Ok((existing, false));
        }
        self.seal = Some(seal.clone());
        Ok((seal, true))
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        let mut records = Vec::with_capacity(self.completions.len() + 2);
        records.push(ExecutionRecord::Opened(self.header.clone()));
        records.extend(self.completions.iter().cloned().map(ExecutionRecord::Step));
        if let Some(seal) = &self.seal {
            records.push(ExecutionRecord::Sealed(seal.clone()));
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{ExecutionStatus, Outcome};
    use crate::procedure::{DefinitionStatus, ProcedureDefinition, StepDefinition, StepType};
    use chrono::Utc;

    fn header() -> ExecutionHeader {
        let definition = ProcedureDefinition::new(
            "p",
            DefinitionStatus::Active,
            vec![
                StepDefinition::new(1, "One", StepType::Action),
                StepDefinition::new(2, "Two", StepType::Action),
            ],
        );
        ExecutionHeader {
            execution_id: ExecutionId::new(),
            procedure_id: "p".to_string(),
            procedure_version: 1,
            operator_id: "op".to_string(),
            started_at: Utc::now(),
            definition,
        }
    }

    fn seal(id: ExecutionId, outcome: Outcome) -> ExecutionSeal {
        ExecutionSeal {
            execution_id: id,
            status: ExecutionStatus::Completed,
            outcome: Some(outcome),
            declared_outcome: Some(outcome),
            reason: None,
            failure_reasons: Vec::new(),
            sealed_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_checks_expected_last() {
        let mut log = ExecutionLog::new(header());
        let id = *log.execution_id();

        log.append(StepCompletion::completed(id, 1, None, false, "op"), None)
            .unwrap();

        let err = log
            .append(StepCompletion::completed(id, 2, None, false, "op"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConcurrentModification {
                expected: None,
                actual: Some(1)
            }
        ));

        let err = log
            .append(StepCompletion::completed(id, 1, None, false, "op"), Some(1))
            .unwrap_err();
        assert!(matches!(err, EngineError::StepAlreadyResolved { step_number: 1 }));

        log.append(StepCompletion::completed(id, 2, None, false, "op"), Some(1))
            .unwrap();
        assert_eq!(log.last_step(), Some(2));
    }

    #[test]
    fn test_sealed_log_rejects_appends() {
        let mut log = ExecutionLog::new(header());
        let id = *log.execution_id();
        let (_, fresh) = log.apply_seal(seal(id, Outcome::Success)).unwrap();
        assert!(fresh);

        let (_, fresh) = log.apply_seal(seal(id, Outcome::Success)).unwrap();
        assert!(!fresh);

        assert!(matches!(
            log.apply_seal(seal(id, Outcome::Conditional)),
            Err(EngineError::AlreadySealed { .. })
        ));
        assert!(matches!(
            log.append(StepCompletion::completed(id, 1, None, false, "op"), None),
            Err(EngineError::ExecutionNotInProgress { .. })
        ));
    }

    #[test]
    fn test_from_records_round_trip() {
        let mut log = ExecutionLog::new(header());
        let id = *log.execution_id();
        log.append(StepCompletion::skipped(id, 1, true, "op"), None)
            .unwrap();
        log.apply_seal(seal(id, Outcome::Success)).unwrap();

        let rebuilt = ExecutionLog::from_records(log.records()).unwrap();
        assert_eq!(rebuilt.records(), log.records());
    }

    #[test]
    fn test_from_records_rejects_headless_history() {
        let id = ExecutionId::new();
        let records = vec![ExecutionRecord::Step(StepCompletion::completed(
            id, 1, None, false, "op",
        ))];
        assert!(matches!(
            ExecutionLog::from_records(records),
            Err(EngineError::Storage(_))
        ));
    }
}
