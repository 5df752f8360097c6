//! Definition registry
//!
//! A process-wide map from `(module, name)` to workflow and activity
//! definitions. Populated at program start, read-only afterwards; the
//! replay engine and activity executor resolve programs through it so a
//! stored workflow row can be re-materialized after any restart.

use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::{ActivityDefinition, DefinitionError, WorkflowDefinition};

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow: {module}::{name}")]
    UnknownWorkflow { module: String, name: String },

    #[error("unknown activity: {module}::{name}")]
    UnknownActivity { module: String, name: String },

    #[error("workflow {module}::{name} is already registered")]
    DuplicateWorkflow { module: String, name: String },

    #[error("activity {module}::{name} is already registered")]
    DuplicateActivity { module: String, name: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Registry of workflow and activity definitions
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<(String, String), Arc<WorkflowDefinition>>,
    activities: HashMap<(String, String), Arc<ActivityDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition; duplicates are rejected.
    pub fn register_workflow(
        &mut self,
        definition: WorkflowDefinition,
    ) -> Result<(), RegistryError> {
        let key = (
            definition.module().to_string(),
            definition.name().to_string(),
        );
        if self.workflows.contains_key(&key) {
            return Err(RegistryError::DuplicateWorkflow {
                module: key.0,
                name: key.1,
            });
        }
        self.workflows.insert(key, Arc::new(definition));
        Ok(())
    }

    /// Register an activity definition; validated here, duplicates rejected.
    pub fn register_activity(
        &mut self,
        definition: ActivityDefinition,
    ) -> Result<(), RegistryError> {
        definition.validate()?;
        let key = (
            definition.module().to_string(),
            definition.name().to_string(),
        );
        if self.activities.contains_key(&key) {
            return Err(RegistryError::DuplicateActivity {
                module: key.0,
                name: key.1,
            });
        }
        self.activities.insert(key, Arc::new(definition));
        Ok(())
    }

    pub fn workflow(
        &self,
        module: &str,
        name: &str,
    ) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.workflows
            .get(&(module.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflow {
                module: module.to_string(),
                name: name.to_string(),
            })
    }

    pub fn activity(
        &self,
        module: &str,
        name: &str,
    ) -> Result<Arc<ActivityDefinition>, RegistryError> {
        self.activities
            .get(&(module.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownActivity {
                module: module.to_string(),
                name: name.to_string(),
            })
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use serde_json::Value;

    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition::builder("Sample", "tests::registry")
            .step("only", |_ctx: &mut crate::context::WorkflowContext| {
                Box::pin(async { Ok(()) })
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_resolve_workflow() {
        let mut registry = Registry::new();
        registry.register_workflow(sample_workflow()).unwrap();

        let def = registry.workflow("tests::registry", "Sample").unwrap();
        assert_eq!(def.name(), "Sample");

        assert!(matches!(
            registry.workflow("tests::registry", "Missing"),
            Err(RegistryError::UnknownWorkflow { .. })
        ));
    }

    #[test]
    fn test_duplicate_workflow_rejected() {
        let mut registry = Registry::new();
        registry.register_workflow(sample_workflow()).unwrap();
        assert!(matches!(
            registry.register_workflow(sample_workflow()),
            Err(RegistryError::DuplicateWorkflow { .. })
        ));
    }

    #[test]
    fn test_invalid_activity_rejected_at_registration() {
        let mut registry = Registry::new();
        let bad = ActivityDefinition::new("bad", "tests::registry", |_| {
            Box::pin(async { Ok(Value::Null) })
        })
        .with_timeout_seconds(7200);

        assert!(matches!(
            registry.register_activity(bad),
            Err(RegistryError::Definition(_))
        ));
    }
}
