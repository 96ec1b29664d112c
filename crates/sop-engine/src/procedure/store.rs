//! Definitions store.
//!
//! The engine reads definitions through [`DefinitionStore`] and never
//! mutates them. [`InMemoryDefinitionStore`] is the bundled implementation,
//! loaded from files or registered programmatically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::procedure::parser::{parse_definition_file, validate_definition};
use crate::procedure::types::{DefinitionStatus, ProcedureDefinition};

/// Read access to authored procedures.
pub trait DefinitionStore: Send + Sync {
    /// Fetch a definition regardless of its status.
    fn get_definition(&self, procedure_id: &str) -> EngineResult<Arc<ProcedureDefinition>>;

    /// Fetch a definition that may be started.
    fn get_active_definition(&self, procedure_id: &str) -> EngineResult<Arc<ProcedureDefinition>> {
        let definition = self.get_definition(procedure_id)?;
        if !definition.is_active() {
            return Err(EngineError::DefinitionNotActive {
                procedure_id: definition.id.clone(),
                status: definition.status,
            });
        }
        Ok(definition)
    }
}

/// Definitions held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<String, Arc<ProcedureDefinition>>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition.
    ///
    /// A draft may be replaced freely. An active or archived definition is
    /// only replaced by a higher version.
    pub fn register(
        &self,
        mut definition: ProcedureDefinition,
    ) -> EngineResult<Arc<ProcedureDefinition>> {
        definition.sort_steps();
        validate_definition(&definition)?;

        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| EngineError::Storage("definitions lock poisoned".to_string()))?;

        if let Some(existing) = definitions.get(&definition.id) {
            if existing.status != DefinitionStatus::Draft && definition.version <= existing.version
            {
                return Err(EngineError::InvalidDefinition(format!(
                    "Procedure '{}' version {} is {}, register a higher version to replace it",
                    existing.id, existing.version, existing.status
                )));
            }
        }

        info!(
            procedure_id = %definition.id,
            version = definition.version,
            status = %definition.status,
            steps = definition.steps.len(),
            "Registered procedure definition"
        );

        let definition = Arc::new(definition);
        definitions.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    /// Change the lifecycle status of a stored definition.
    pub fn set_status(&self, procedure_id: &str, status: DefinitionStatus) -> EngineResult<()> {
        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| EngineError::Storage("definitions lock poisoned".to_string()))?;

        let existing = definitions
            .get(procedure_id)
            .ok_or_else(|| EngineError::DefinitionNotFound(procedure_id.to_string()))?;

        let mut updated = ProcedureDefinition::clone(existing);
        debug!(procedure_id, from = %updated.status, to = %status, "Definition status change");
        updated.status = status;
        definitions.insert(procedure_id.to_string(), Arc::new(updated));
        Ok(())
    }

    /// Register every `.yaml`, `.yml` and `.json` file in a directory.
    pub fn load_dir(&self, dir: &Path) -> EngineResult<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml" | "json")
                )
            })
            .collect();
        paths.sort();

        for path in &paths {
            self.register(parse_definition_file(path)?)?;
        }
        Ok(paths.len())
    }

    pub fn len(&self) -> usize {
        self.definitions.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn get_definition(&self, procedure_id: &str) -> EngineResult<Arc<ProcedureDefinition>> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| EngineError::Storage("definitions lock poisoned".to_string()))?;
        definitions
            .get(procedure_id)
            .cloned()
            .ok_or_else(|| EngineError::DefinitionNotFound(procedure_id.to_string()))
    }
}
