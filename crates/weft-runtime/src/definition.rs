//! Workflow and activity definitions
//!
//! A workflow is declared as an ordered list of named steps, each a boxed
//! async handler over the [`WorkflowContext`]. An activity is a free async
//! handler over JSON arguments with a retry budget and a timeout. Both are
//! validated when they are built or registered; the registry re-resolves
//! them by `(module, name)` across process restarts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use weft_core::{ActivityMetadata, StepResult};

use crate::context::WorkflowContext;

/// Boxed future returned by a step handler, borrowing the context.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = StepResult<()>> + Send + 'a>>;

type StepHandler = Arc<dyn for<'a> Fn(&'a mut WorkflowContext) -> StepFuture<'a> + Send + Sync>;

/// Boxed future returned by an activity handler.
pub type ActivityFuture = Pin<Box<dyn Future<Output = Result<Value, anyhow::Error>> + Send>>;

type ActivityHandler = Arc<dyn Fn(Vec<Value>) -> ActivityFuture + Send + Sync>;

/// Validation errors raised when a definition is built or registered
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow '{0}' must declare at least one step")]
    NoSteps(String),

    #[error("workflow '{workflow}' declares duplicate step '{step}'")]
    DuplicateStep { workflow: String, step: String },

    #[error("{0} name must be a non-empty string")]
    EmptyName(&'static str),

    #[error("activity '{activity}' retry_count {value} is outside [0, 100]")]
    RetryCountOutOfRange { activity: String, value: i64 },

    #[error("activity '{activity}' timeout_seconds {value} is outside (0, 3600]")]
    TimeoutOutOfRange { activity: String, value: i64 },
}

/// One ordered section of workflow code
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    description: String,
    handler: StepHandler,
}

impl StepDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn run<'a>(&self, ctx: &'a mut WorkflowContext) -> StepFuture<'a> {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .finish()
    }
}

/// A named, versioned workflow program: metadata plus ordered steps
#[derive(Clone)]
pub struct WorkflowDefinition {
    name: String,
    description: String,
    version: String,
    module: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Start building a definition. `module` is the registry locator,
    /// conventionally `module_path!()` at the declaration site.
    pub fn builder(name: impl Into<String>, module: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            module: module.into(),
            description: String::new(),
            version: "1.0.0".to_string(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub(crate) fn to_new_workflow(&self) -> weft_core::NewWorkflow {
        weft_core::NewWorkflow {
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            module: self.module.clone(),
        }
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("module", &self.module)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`WorkflowDefinition`]
pub struct WorkflowBuilder {
    name: String,
    module: String,
    description: String,
    version: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Append a step. Steps execute in the order they are declared.
    pub fn step<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut WorkflowContext) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.steps.push(StepDefinition {
            name: name.into(),
            description: String::new(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Append a step with a description.
    pub fn step_described<F>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: for<'a> Fn(&'a mut WorkflowContext) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.steps.push(StepDefinition {
            name: name.into(),
            description: description.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Validate step ordering and uniqueness and produce the definition.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName("workflow"));
        }
        if self.module.is_empty() {
            return Err(DefinitionError::EmptyName("module"));
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.name));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(DefinitionError::EmptyName("step"));
            }
            if !seen.insert(step.name.clone()) {
                return Err(DefinitionError::DuplicateStep {
                    workflow: self.name,
                    step: step.name.clone(),
                });
            }
        }

        Ok(WorkflowDefinition {
            name: self.name,
            description: self.description,
            version: self.version,
            module: self.module,
            steps: self.steps,
        })
    }
}

/// A side-effectful function invoked from workflows
///
/// The handler receives the recorded argument list and returns a JSON
/// result. Failures are retried by the dispatcher up to `retry_count`
/// times with exponential backoff; execution is bounded by
/// `timeout_seconds`.
#[derive(Clone)]
pub struct ActivityDefinition {
    name: String,
    description: String,
    module: String,
    retry_count: i64,
    timeout_seconds: i64,
    handler: ActivityHandler,
}

impl ActivityDefinition {
    pub fn new<F>(name: impl Into<String>, module: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> ActivityFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            module: module.into(),
            retry_count: 0,
            timeout_seconds: 60,
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_retry_count(mut self, retry_count: i64) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn retry_count(&self) -> i64 {
        self.retry_count
    }

    pub fn timeout_seconds(&self) -> i64 {
        self.timeout_seconds
    }

    /// The metadata persisted in `ACTIVITY_SCHEDULED`.
    pub fn metadata(&self, args: Vec<Value>) -> ActivityMetadata {
        ActivityMetadata {
            name: self.name.clone(),
            description: self.description.clone(),
            retry_count: self.retry_count,
            timeout_seconds: self.timeout_seconds,
            module: self.module.clone(),
            args,
        }
    }

    pub(crate) fn run(&self, args: Vec<Value>) -> ActivityFuture {
        (self.handler)(args)
    }

    pub(crate) fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName("activity"));
        }
        if self.module.is_empty() {
            return Err(DefinitionError::EmptyName("module"));
        }
        if !(0..=100).contains(&self.retry_count) {
            return Err(DefinitionError::RetryCountOutOfRange {
                activity: self.name.clone(),
                value: self.retry_count,
            });
        }
        if !(1..=3600).contains(&self.timeout_seconds) {
            return Err(DefinitionError::TimeoutOutOfRange {
                activity: self.name.clone(),
                value: self.timeout_seconds,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ActivityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDefinition")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("retry_count", &self.retry_count)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_step(_ctx: &mut WorkflowContext) -> StepFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn test_builder_produces_ordered_steps() {
        let def = WorkflowDefinition::builder("Order", module_path!())
            .version("2.0.0")
            .step("reserve", |ctx: &mut WorkflowContext| {
                Box::pin(noop_step(ctx))
            })
            .step("charge", |ctx: &mut WorkflowContext| {
                Box::pin(noop_step(ctx))
            })
            .build()
            .unwrap();

        let names: Vec<_> = def.steps().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["reserve", "charge"]);
        assert_eq!(def.version(), "2.0.0");
    }

    #[test]
    fn test_workflow_without_steps_rejected() {
        let err = WorkflowDefinition::builder("Empty", module_path!())
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::NoSteps(_)));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = WorkflowDefinition::builder("Dup", module_path!())
            .step("same", |ctx: &mut WorkflowContext| Box::pin(noop_step(ctx)))
            .step("same", |ctx: &mut WorkflowContext| Box::pin(noop_step(ctx)))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStep { .. }));
    }

    #[test]
    fn test_activity_validation_bounds() {
        let ok = ActivityDefinition::new("ping", module_path!(), |_| {
            Box::pin(async { Ok(Value::Null) })
        })
        .with_retry_count(3)
        .with_timeout_seconds(30);
        assert!(ok.validate().is_ok());

        let bad_retry = ActivityDefinition::new("ping", module_path!(), |_| {
            Box::pin(async { Ok(Value::Null) })
        })
        .with_retry_count(101);
        assert!(matches!(
            bad_retry.validate(),
            Err(DefinitionError::RetryCountOutOfRange { .. })
        ));

        let bad_timeout = ActivityDefinition::new("ping", module_path!(), |_| {
            Box::pin(async { Ok(Value::Null) })
        })
        .with_timeout_seconds(0);
        assert!(matches!(
            bad_timeout.validate(),
            Err(DefinitionError::TimeoutOutOfRange { .. })
        ));
    }

    #[test]
    fn test_metadata_records_args() {
        let def = ActivityDefinition::new("greet", "demo::acts", |_| {
            Box::pin(async { Ok(Value::Null) })
        })
        .with_retry_count(2);

        let meta = def.metadata(vec![serde_json::json!("World")]);
        assert_eq!(meta.name, "greet");
        assert_eq!(meta.module, "demo::acts");
        assert_eq!(meta.retry_count, 2);
        assert_eq!(meta.args, vec![serde_json::json!("World")]);
    }
}
