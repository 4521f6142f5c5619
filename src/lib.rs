/// runloom: queued workflow execution engine
///
/// Executes n8n-style workflow graphs as durable, retryable background runs: a run
/// is created and queued by the API, claimed by a worker, executed node by node and
/// recorded with its outputs, logs and usage.

// Core configuration and setup
pub mod config;

// SQLite database handle and schema
pub mod store;

// Workflow definitions - graph model and storage
pub mod workflow;

// Run records and usage metering
pub mod run;

// Runtime execution engine - ordering, dispatch and the run worker
pub mod runtime;

// Durable job queue
pub mod queue;

// HTTP API layer - workflow, run and queue endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use run::{Run, RunStatus};
pub use runtime::{ExecutionEngine, RunWorker};
pub use server::start_server;
pub use workflow::{Node, NodeKind, WorkflowGraph};
