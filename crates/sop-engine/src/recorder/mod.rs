//! Execution recorder.
//!
//! The recorder is the system of record for executions. Every execution is
//! an append-only sequence of [`ExecutionRecord`]s:
//!
//! 1. `opened`: header with a snapshot of the definition
//! 2. `step`: one per resolved step, strictly ascending
//! 3. `sealed`: terminal status and outcome, written once
//!
//! Appends are compare-and-append on the last resolved step number, which
//! is what turns two racing submissions into one success and one
//! [`crate::EngineError::ConcurrentModification`].

pub mod journal;
pub mod log;
pub mod memory;
pub mod models;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::procedure::StepNumber;

pub use journal::JournalRecorder;
pub use log::ExecutionLog;
pub use memory::InMemoryRecorder;
pub use models::{ExecutionHeader, ExecutionRecord, ExecutionSeal, StepAction, StepCompletion};

/// Unique execution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| EngineError::Parse(format!("invalid execution id '{}': {}", s, e)))
    }
}

/// Durable, append-only storage of execution records.
pub trait ExecutionRecorder: Send + Sync {
    /// Create a new execution. Fails if the id is already taken.
    fn open(&self, header: ExecutionHeader) -> EngineResult<()>;

    /// Append a step record if the last resolved step is still
    /// `expected_last`.
    fn append(
        &self,
        completion: StepCompletion,
        expected_last: Option<StepNumber>,
    ) -> EngineResult<()>;

    /// Seal the execution. Sealing again with the same terms returns the
    /// existing seal.
    fn seal(&self, seal: ExecutionSeal) -> EngineResult<ExecutionSeal>;

    /// All records of an execution in append order.
    fn records(&self, execution_id: &ExecutionId) -> EngineResult<Vec<ExecutionRecord>>;

    /// Ids of every known execution.
    fn execution_ids(&self) -> EngineResult<Vec<ExecutionId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_round_trip() {
        let id = ExecutionId::new();
        let parsed: ExecutionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_execution_id_rejects_garbage() {
        let err = "not-a-uuid".parse::<ExecutionId>().unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
