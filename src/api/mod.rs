/// HTTP API Layer
///
/// Thin REST surface over the engine: workflow definitions, run creation and
/// cancellation, run inspection and queue statistics.

use crate::{queue::JobQueue, run::RunStore, workflow::WorkflowStorage};
use std::sync::Arc;

// Workflow definition endpoints (PUT/GET)
pub mod workflows;

// Run lifecycle endpoints and queue stats
pub mod runs;

pub use runs::create_run_routes;
pub use workflows::create_workflow_routes;

/// Shared resources handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub workflows: WorkflowStorage,
    pub runs: Arc<dyn RunStore>,
    pub queue: JobQueue,
}
