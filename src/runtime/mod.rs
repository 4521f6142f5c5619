/// Runtime Execution Engine
///
/// This module turns stored workflow graphs into executed runs. It handles:
/// - Dependency-respecting execution order and input resolution
/// - Dispatch of nodes to their type handlers
/// - Sequential execution with cancellation checks
/// - The run lifecycle worker and its queue consumers

// Per-run state: node outputs, execution log, node counter
pub mod context;

// Execution order resolver and input resolution
pub mod order;

// Node type registry and built-in handlers
pub mod executor;

// Sequential execution engine
pub mod engine;

// Run lifecycle worker and consumer pool
pub mod worker;

// Re-export main types
pub use context::{ExecutionContext, ExecutionLog};
pub use engine::{CancelSignal, EngineError, ExecutionEngine, ExecutionOutcome, ExecutionReport, NeverCancelled};
pub use executor::{NodeExecutor, NodeHandler};
pub use order::{execution_order, NodeInput};
pub use worker::{ProcessOutcome, RunWorker, WorkerHandle, WorkerPool};
