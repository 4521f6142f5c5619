/// Run record persistence
///
/// The worker mutates runs only through `RunStore`, at well-defined lifecycle
/// transitions. Every write is guarded on the current status so a cancellation that
/// lands mid-run is never overwritten by a late success or failure.

use crate::run::types::{CancelOutcome, Run, RunFailure, RunFilter, RunStatus, RunSuccess};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::{SqlitePool, SqliteRow}, Row};
use uuid::Uuid;

/// Storage collaborator owning run records
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run in `queued` state
    async fn create_run(&self, workflow_id: &str, workspace_id: &str, input_data: Value) -> Result<Run>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>>;

    async fn get_status(&self, id: &str) -> Result<Option<RunStatus>>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// `queued|failed -> running`; returns false when the run is cancelled, finished or missing
    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool>;

    /// `running -> success`; returns false when the run left `running` meanwhile
    async fn mark_succeeded(&self, id: &str, result: RunSuccess) -> Result<bool>;

    /// `running -> failed`; returns false when the run left `running` meanwhile
    async fn mark_failed(&self, id: &str, failure: RunFailure) -> Result<bool>;

    /// Attach the partial log of a run that was cancelled while executing
    async fn record_cancelled(&self, id: &str, logs: String, node_executions: u64, finished_at: DateTime<Utc>) -> Result<()>;

    /// External cancellation request, accepted while `queued` or `running`
    async fn cancel_run(&self, id: &str) -> Result<CancelOutcome>;
}

/// SQLite implementation of `RunStore`
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const RUN_COLUMNS: &str = "id, workflow_id, workspace_id, status, input_data, output_data, logs, \
    error_message, node_executions, created_at, started_at, finished_at, duration_ms";

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| anyhow::anyhow!("Invalid timestamp '{}': {}", text, e))
    })
    .transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    let input_data: String = row.try_get("input_data")?;
    let output_data: Option<String> = row.try_get("output_data")?;
    let created_at: String = row.try_get("created_at")?;
    let node_executions: i64 = row.try_get("node_executions")?;

    Ok(Run {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        workspace_id: row.try_get("workspace_id")?,
        status: RunStatus::parse(&status)?,
        input_data: serde_json::from_str(&input_data)?,
        output_data: output_data.map(|raw| serde_json::from_str(&raw)).transpose()?,
        logs: row.try_get("logs")?,
        error_message: row.try_get("error_message")?,
        node_executions: node_executions.max(0) as u64,
        created_at: parse_time(Some(created_at))?
            .ok_or_else(|| anyhow::anyhow!("Run without created_at"))?,
        started_at: parse_time(row.try_get("started_at")?)?,
        finished_at: parse_time(row.try_get("finished_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, workflow_id: &str, workspace_id: &str, input_data: Value) -> Result<Run> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO runs (id, workflow_id, workspace_id, status, input_data, node_executions, created_at)
            VALUES (?, ?, ?, 'queued', ?, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(workflow_id)
        .bind(workspace_id)
        .bind(serde_json::to_string(&input_data)?)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!("📝 Created run {} for workflow {}", id, workflow_id);

        self.get_run(&id).await?
            .ok_or_else(|| anyhow::anyhow!("Run {} vanished after insert", id))
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_status(&self, id: &str) -> Result<Option<RunStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        status.as_deref().map(RunStatus::parse).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let (limit, offset) = filter.window();
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM runs
            WHERE (? IS NULL OR workspace_id = ?)
              AND (? IS NULL OR workflow_id = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
            RUN_COLUMNS
        ))
        .bind(&filter.workspace_id)
        .bind(&filter.workspace_id)
        .bind(&filter.workflow_id)
        .bind(&filter.workflow_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', started_at = ?, finished_at = NULL, duration_ms = NULL, error_message = NULL
            WHERE id = ? AND status IN ('queued', 'running', 'failed')
            "#,
        )
        .bind(started_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_succeeded(&self, id: &str, result: RunSuccess) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'success', finished_at = ?, duration_ms = ?, output_data = ?, logs = ?,
                node_executions = ?, error_message = NULL
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(result.finished_at.to_rfc3339())
        .bind(result.duration_ms)
        .bind(serde_json::to_string(&result.output_data)?)
        .bind(&result.logs)
        .bind(result.node_executions as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: &str, failure: RunFailure) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed', finished_at = ?, duration_ms = ?, error_message = ?, logs = ?,
                node_executions = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(failure.finished_at.to_rfc3339())
        .bind(failure.duration_ms)
        .bind(&failure.error_message)
        .bind(&failure.logs)
        .bind(failure.node_executions as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn record_cancelled(&self, id: &str, logs: String, node_executions: u64, finished_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET logs = ?, node_executions = ?, finished_at = COALESCE(finished_at, ?)
            WHERE id = ? AND status = 'cancelled'
            "#,
        )
        .bind(&logs)
        .bind(node_executions as i64)
        .bind(finished_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_run(&self, id: &str) -> Result<CancelOutcome> {
        let Some(run) = self.get_run(id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if !run.status.is_cancellable() {
            return Ok(CancelOutcome::NotCancellable(run.status));
        }

        // The status may still move underneath us; the guard keeps terminal runs intact
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'cancelled', finished_at = ?
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        let run = self.get_run(id).await?
            .ok_or_else(|| anyhow::anyhow!("Run {} vanished while cancelling", id))?;

        if result.rows_affected() > 0 {
            tracing::info!("🛑 Run {} cancelled", id);
            Ok(CancelOutcome::Cancelled(run))
        } else {
            Ok(CancelOutcome::NotCancellable(run.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use serde_json::json;

    async fn store() -> SqliteRunStore {
        let db = Database::in_memory().await.unwrap();
        SqliteRunStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let store = store().await;
        let run = store.create_run("wf", "ws", json!({"a": 1})).await.unwrap();

        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.input_data, json!({"a": 1}));
        assert!(run.started_at.is_none());
        assert_eq!(store.get_status(&run.id).await.unwrap(), Some(RunStatus::Queued));
        assert!(store.get_run("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_success_transition() {
        let store = store().await;
        let run = store.create_run("wf", "ws", json!({})).await.unwrap();
        let started = Utc::now();

        assert!(store.mark_running(&run.id, started).await.unwrap());
        let ok = store.mark_succeeded(&run.id, RunSuccess {
            finished_at: started + chrono::Duration::milliseconds(15),
            duration_ms: 15,
            output_data: json!({"A": {"x": 1}}),
            logs: "line one\nline two".into(),
            node_executions: 1,
        }).await.unwrap();
        assert!(ok);

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(loaded.duration_ms, Some(15));
        assert_eq!(loaded.output_data, Some(json!({"A": {"x": 1}})));
        assert_eq!(loaded.node_executions, 1);
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let store = store().await;
        let run = store.create_run("wf", "ws", json!({})).await.unwrap();

        match store.cancel_run(&run.id).await.unwrap() {
            CancelOutcome::Cancelled(run) => {
                assert_eq!(run.status, RunStatus::Cancelled);
                assert!(run.finished_at.is_some());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Terminal runs cannot be cancelled again, nor restarted
        assert!(matches!(
            store.cancel_run(&run.id).await.unwrap(),
            CancelOutcome::NotCancellable(RunStatus::Cancelled)
        ));
        assert!(!store.mark_running(&run.id, Utc::now()).await.unwrap());
        assert!(matches!(store.cancel_run("missing").await.unwrap(), CancelOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_failed_run_is_not_cancellable() {
        let store = store().await;
        let run = store.create_run("wf", "ws", json!({})).await.unwrap();
        store.mark_running(&run.id, Utc::now()).await.unwrap();
        store.mark_failed(&run.id, RunFailure {
            finished_at: Utc::now(),
            duration_ms: Some(3),
            error_message: "boom".into(),
            logs: String::new(),
            node_executions: 0,
        }).await.unwrap();

        assert!(matches!(
            store.cancel_run(&run.id).await.unwrap(),
            CancelOutcome::NotCancellable(RunStatus::Failed)
        ));
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_late_success_does_not_override_cancel() {
        let store = store().await;
        let run = store.create_run("wf", "ws", json!({})).await.unwrap();
        store.mark_running(&run.id, Utc::now()).await.unwrap();
        store.cancel_run(&run.id).await.unwrap();

        let ok = store.mark_succeeded(&run.id, RunSuccess {
            finished_at: Utc::now(),
            duration_ms: 1,
            output_data: json!({}),
            logs: String::new(),
            node_executions: 0,
        }).await.unwrap();
        assert!(!ok);

        store.record_cancelled(&run.id, "partial".into(), 2, Utc::now()).await.unwrap();
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Cancelled);
        assert_eq!(loaded.logs.as_deref(), Some("partial"));
        assert_eq!(loaded.node_executions, 2);
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_pages() {
        let store = store().await;
        for _ in 0..3 {
            store.create_run("wf-a", "ws-1", json!({})).await.unwrap();
        }
        let other = store.create_run("wf-b", "ws-2", json!({})).await.unwrap();
        store.cancel_run(&other.id).await.unwrap();

        let ws1 = store.list_runs(&RunFilter { workspace_id: Some("ws-1".into()), ..Default::default() }).await.unwrap();
        assert_eq!(ws1.len(), 3);

        let cancelled = store.list_runs(&RunFilter { status: Some(RunStatus::Cancelled), ..Default::default() }).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].workflow_id, "wf-b");

        let page = store.list_runs(&RunFilter { page: Some(2), limit: Some(2), ..Default::default() }).await.unwrap();
        assert_eq!(page.len(), 2);
    }
}
