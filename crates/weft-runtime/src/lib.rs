//! Durable workflow runtime
//!
//! Weft executes long-running workflows as ordered steps over an
//! append-only event log. A workflow program is re-executed from the
//! start on every scheduling tick; each decision point (activity, timer,
//! signal, state write) either consumes its matching history event or
//! persists a new scheduling event and suspends the tick. This replay
//! discipline makes workflow code durable across crashes without
//! serializing continuations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │   N drivers polling the Dispatcher, graceful shutdown        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │   STEP → ReplayEngine   ACTIVITY → ActivityExecutor          │
//! │   TIMER → fire/release                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    EventStore (weft-store)                   │
//! │   workflows, events, tasks, logs                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use weft_runtime::prelude::*;
//!
//! fn format_greeting() -> ActivityDefinition {
//!     ActivityDefinition::new("format_greeting", module_path!(), |args| {
//!         Box::pin(async move {
//!             let name = args[0].as_str().unwrap_or("stranger").to_string();
//!             Ok(serde_json::json!(format!("Hello, {name}!")))
//!         })
//!     })
//!     .with_retry_count(3)
//!     .with_timeout_seconds(10)
//! }
//!
//! async fn create_greeting(ctx: &mut WorkflowContext) -> StepResult<()> {
//!     let name = ctx.input()["name"].clone();
//!     let greeting = ctx.activity(&format_greeting(), vec![name]).await?;
//!     ctx.state().set("greeting", greeting).await?;
//!     Ok(())
//! }
//!
//! fn hello_workflow() -> WorkflowDefinition {
//!     WorkflowDefinition::builder("HelloWorkflow", module_path!())
//!         .step("create_greeting", |ctx| Box::pin(create_greeting(ctx)))
//!         .build()
//!         .expect("valid workflow")
//! }
//! ```

pub mod client;
pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod handle;
pub mod registry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::context::{BatchScope, StateHandle, WorkflowContext, WorkflowLogger};
    pub use crate::definition::{
        ActivityDefinition, ActivityFuture, StepFuture, WorkflowDefinition,
    };
    pub use crate::dispatcher::Dispatcher;
    pub use crate::engine::{ReplayEngine, TickOutcome};
    pub use crate::handle::{HandleError, WorkflowHandle};
    pub use crate::registry::Registry;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
    pub use weft_core::{StepError, StepResult};
}

pub use client::Client;
pub use context::{BatchScope, StateHandle, WorkflowContext, WorkflowLogger};
pub use definition::{
    ActivityDefinition, ActivityFuture, DefinitionError, StepDefinition, StepFuture,
    WorkflowDefinition,
};
pub use dispatcher::Dispatcher;
pub use engine::{ReplayEngine, TickOutcome};
pub use executor::ActivityExecutor;
pub use handle::{HandleError, WorkflowHandle};
pub use registry::{Registry, RegistryError};
pub use worker::{WorkerPool, WorkerPoolConfig};
