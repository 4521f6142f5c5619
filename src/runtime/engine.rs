/// Workflow execution engine
///
/// Turns a workflow graph into a linear, dependency-respecting execution: computes
/// the order, optionally rejects cyclic graphs, then dispatches nodes one at a time,
/// threading outputs along connections. Execution within a run is strictly
/// sequential; there is no parallel dispatch of independent branches.

use crate::config::{CyclePolicy, EngineConfig};
use crate::runtime::context::{ExecutionContext, ExecutionLog};
use crate::runtime::executor::NodeExecutor;
use crate::runtime::order::{execution_order, find_cycles};
use crate::workflow::types::WorkflowGraph;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Errors that abort a run
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Workflow graph contains a cycle through: {}", .nodes.join(", "))]
    GraphCycle { nodes: Vec<String> },

    #[error("Node {node} failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Cooperative cancellation check, consulted before each node dispatch
#[async_trait]
pub trait CancelSignal: Send + Sync {
    async fn is_cancelled(&self) -> anyhow::Result<bool>;
}

/// Signal for executions that cannot be cancelled
#[derive(Debug, Clone, Copy)]
pub struct NeverCancelled;

#[async_trait]
impl CancelSignal for NeverCancelled {
    async fn is_cancelled(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// What an execution produced, successful or not
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Output of every node that finished, keyed by node name
    pub outputs: Map<String, Value>,
    pub log: ExecutionLog,
    pub node_executions: u64,
}

impl ExecutionReport {
    fn from_context(context: ExecutionContext) -> Self {
        Self {
            outputs: context.node_outputs,
            log: context.log,
            node_executions: context.node_execution_count,
        }
    }

    /// The `outputData` payload of the run
    pub fn output_data(&self) -> Value {
        Value::Object(self.outputs.clone())
    }
}

/// Non-failing end of an execution
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed(ExecutionReport),
    /// The run was cancelled externally; `next_node` never started
    Cancelled { next_node: String, report: ExecutionReport },
}

/// A failed execution with everything produced before the failure
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: EngineError,
    pub report: ExecutionReport,
}

/// Sequential execution engine
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    /// Node executor for handling individual node execution
    executor: Arc<NodeExecutor>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(executor: Arc<NodeExecutor>, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    /// Execute every node of the graph once, in dependency order
    ///
    /// Nodes without upstream producers receive `input`. The first node error aborts
    /// the execution; nothing after it runs.
    pub async fn execute(
        &self,
        graph: &WorkflowGraph,
        input: &Value,
        cancel: &dyn CancelSignal,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        let workflow_start_time = std::time::Instant::now();
        let mut context = ExecutionContext::new();

        context.log.push("🚀 Starting workflow execution");
        context.log.push(format!("Workflow: {}", graph.name));
        context.log.push(format!("Found {} nodes to execute", graph.nodes.len()));

        if self.config.cycle_policy == CyclePolicy::Reject {
            let cyclic = find_cycles(graph);
            if !cyclic.is_empty() {
                let error = EngineError::GraphCycle { nodes: cyclic };
                context.log.push(format!("❌ Workflow execution failed: {}", error));
                return Err(ExecutionFailure { error, report: ExecutionReport::from_context(context) });
            }
        }

        let order = execution_order(graph);
        let order_names: Vec<&str> = order.iter().map(|node| node.name.as_str()).collect();
        context.log.push(format!("Execution order: {}", order_names.join(" → ")));

        for (step_num, node) in order.iter().enumerate() {
            if self.config.cancellation_checks && self.cancel_requested(cancel).await {
                context.log.push(format!("🛑 Run cancelled before node: {}", node.name));
                return Ok(ExecutionOutcome::Cancelled {
                    next_node: node.name.clone(),
                    report: ExecutionReport::from_context(context),
                });
            }

            tracing::debug!("📍 Step {}/{}: {}", step_num + 1, order.len(), node.name);

            if let Err(error) = self.executor.dispatch(graph, node, input, &mut context).await {
                context.log.push(format!("❌ Workflow execution failed: {}", error));
                return Err(ExecutionFailure { error, report: ExecutionReport::from_context(context) });
            }
        }

        context.log.push("✅ Workflow execution completed successfully");
        tracing::info!("🎉 Workflow '{}' completed in {:?}", graph.name, workflow_start_time.elapsed());

        Ok(ExecutionOutcome::Completed(ExecutionReport::from_context(context)))
    }

    /// A failing check never stops the run; the next one gets another chance
    async fn cancel_requested(&self, cancel: &dyn CancelSignal) -> bool {
        match cancel.is_cancelled().await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                tracing::warn!("⚠️ Cancellation check failed, continuing: {}", e);
                false
            }
        }
    }
}
