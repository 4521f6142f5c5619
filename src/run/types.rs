/// Run record definitions
///
/// A run is one execution attempt of a workflow. It is created `queued` by the API
/// layer, moved to `running` by the worker at dequeue time, and ends in exactly one
/// of the terminal states `success`, `failed` or `cancelled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(anyhow::anyhow!("Unknown run status: {}", other)),
        }
    }

    /// Cancellation is only accepted before the run reached a terminal state
    pub fn is_cancellable(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted run record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub workspace_id: String,
    pub status: RunStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub logs: Option<String>,
    pub error_message: Option<String>,
    pub node_executions: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Write-back for `running -> success`
#[derive(Debug, Clone)]
pub struct RunSuccess {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub output_data: Value,
    pub logs: String,
    pub node_executions: u64,
}

/// Write-back for `running -> failed`
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub error_message: String,
    pub logs: String,
    pub node_executions: u64,
}

/// Result of a cancellation request
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled(Run),
    NotCancellable(RunStatus),
    NotFound,
}

/// Filters for listing runs, newest first
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    pub workspace_id: Option<String>,
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
    /// 1-based page number
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl RunFilter {
    pub const DEFAULT_LIMIT: u32 = 50;

    /// (limit, offset) for the SQL query
    pub fn window(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 500) as i64;
        let page = self.page.unwrap_or(1).max(1) as i64;
        (limit, (page - 1) * limit)
    }
}
