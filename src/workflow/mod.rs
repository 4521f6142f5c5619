/// Workflow Management Layer
///
/// This module handles workflow definitions and their persistence:
/// - Graph model (WorkflowGraph, Node, Connection, NodeKind)
/// - SQLite persistence behind the WorkflowSource trait

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for workflow definitions
pub mod storage;

// Re-export commonly used types
pub use storage::{StoredWorkflow, WorkflowSource, WorkflowStorage};
pub use types::{Connection, Node, NodeKind, WorkflowGraph};
