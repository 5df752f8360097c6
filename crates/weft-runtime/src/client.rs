//! Client API for starting and reattaching workflows

use std::sync::Arc;

use serde_json::Value;

use weft_store::{EventStore, StoreError};

use crate::definition::WorkflowDefinition;
use crate::handle::WorkflowHandle;

/// Entry point for application code that starts workflows
///
/// # Example
///
/// ```ignore
/// let client = Client::new(store.clone());
/// let handle = client.start(&hello_workflow(), json!({"name": "World"})).await?;
/// println!("started {}", handle.id());
/// ```
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn EventStore>,
}

impl Client {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Create a workflow in RUNNING with its first driver task enqueued.
    pub async fn start(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<WorkflowHandle, StoreError> {
        let workflow_id = self
            .store
            .create_workflow(&definition.to_new_workflow(), &input)
            .await?;
        Ok(WorkflowHandle::new(self.store.clone(), workflow_id))
    }

    /// Reattach to an existing workflow by id.
    pub fn handle(&self, workflow_id: impl Into<String>) -> WorkflowHandle {
        WorkflowHandle::with_id(self.store.clone(), workflow_id)
    }
}
