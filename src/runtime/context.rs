/// Per-run execution state
///
/// Holds node outputs, the execution log and the node execution counter for exactly
/// one run. A fresh context is created for every job; nothing is shared across runs.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Append-only, timestamped log of one run
///
/// Lines look like `[2024-05-01T10:00:00.000Z] message` and are mirrored to tracing.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    lines: Vec<String>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        tracing::info!("{}", message);
        self.lines.push(format!("[{}] {}", timestamp, message));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Flattened log text as persisted on the run record
    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

/// Runtime state of one execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Last output of every node that finished, in completion order
    pub node_outputs: Map<String, Value>,
    /// Execution log
    pub log: ExecutionLog,
    /// One per dispatched node, unknown types included
    pub node_execution_count: u64,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_of(&self, node_name: &str) -> Option<&Value> {
        self.node_outputs.get(node_name)
    }

    pub fn record_output(&mut self, node_name: &str, output: Value) {
        self.node_outputs.insert(node_name.to_string(), output);
    }
}
