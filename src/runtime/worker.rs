/// Run lifecycle worker and queue consumer pool
///
/// `RunWorker` processes one run end to end: it guards against redelivery, moves the
/// run through its states, executes the workflow and notifies usage. `WorkerPool`
/// feeds it jobs from the queue with heartbeats, retries and stall recovery.

use crate::config::WorkerConfig;
use crate::queue::{FailOutcome, Job, JobQueue};
use crate::run::{RunFailure, RunStatus, RunStore, RunSuccess, UsageSink};
use crate::runtime::engine::{CancelSignal, ExecutionEngine, ExecutionOutcome};
use crate::workflow::WorkflowSource;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How processing of a run ended, when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded { node_executions: u64 },
    Cancelled,
    /// Redelivered run already in a state that must not be re-executed
    Skipped(RunStatus),
}

/// Cancellation signal reading the run's persisted status
struct RunCancelSignal {
    runs: Arc<dyn RunStore>,
    run_id: String,
}

#[async_trait]
impl CancelSignal for RunCancelSignal {
    async fn is_cancelled(&self) -> Result<bool> {
        Ok(self.runs.get_status(&self.run_id).await? == Some(RunStatus::Cancelled))
    }
}

fn elapsed_ms(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> i64 {
    (finished_at - started_at).num_milliseconds().max(0)
}

/// Processes a single run; stateless across runs
#[derive(Clone)]
pub struct RunWorker {
    runs: Arc<dyn RunStore>,
    workflows: Arc<dyn WorkflowSource>,
    usage: Arc<dyn UsageSink>,
    engine: Arc<ExecutionEngine>,
}

impl RunWorker {
    pub fn new(
        runs: Arc<dyn RunStore>,
        workflows: Arc<dyn WorkflowSource>,
        usage: Arc<dyn UsageSink>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self { runs, workflows, usage, engine }
    }

    /// Process a run once
    ///
    /// Returns an error after marking the run failed, so the queue can retry it.
    pub async fn process(&self, run_id: &str) -> Result<ProcessOutcome> {
        let run = self.runs.get_run(run_id).await?
            .ok_or_else(|| anyhow::anyhow!("Run {} not found", run_id))?;

        if matches!(run.status, RunStatus::Success | RunStatus::Cancelled) {
            tracing::info!("⏭️ Run {} already {}, skipping", run.id, run.status);
            return Ok(ProcessOutcome::Skipped(run.status));
        }

        let started_at = Utc::now();
        if !self.runs.mark_running(run_id, started_at).await? {
            let status = self.runs.get_status(run_id).await?.unwrap_or(run.status);
            tracing::info!("⏭️ Run {} could not start from {}, skipping", run_id, status);
            return Ok(ProcessOutcome::Skipped(status));
        }

        tracing::info!("🏃 Processing run {} of workflow {}", run.id, run.workflow_id);

        let workflow = match self.workflows.get_workflow(&run.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                let message = format!("Workflow {} not found", run.workflow_id);
                self.fail_run(run_id, started_at, message.clone(), message.clone(), 0).await?;
                return Err(anyhow::anyhow!(message));
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.fail_run(run_id, started_at, message.clone(), format!("{:?}", e), 0).await?;
                return Err(e);
            }
        };

        let graph = match workflow.graph() {
            Ok(graph) => graph,
            Err(e) => {
                let message = format!("{:#}", e);
                self.fail_run(run_id, started_at, message.clone(), format!("{:?}", e), 0).await?;
                return Err(e);
            }
        };

        let cancel = RunCancelSignal { runs: Arc::clone(&self.runs), run_id: run_id.to_string() };

        match self.engine.execute(&graph, &run.input_data, &cancel).await {
            Ok(ExecutionOutcome::Completed(report)) => {
                let finished_at = Utc::now();
                let node_executions = report.node_executions;
                let stored = self.runs.mark_succeeded(run_id, RunSuccess {
                    finished_at,
                    duration_ms: elapsed_ms(started_at, finished_at),
                    output_data: report.output_data(),
                    logs: report.log.joined(),
                    node_executions,
                }).await?;

                if !stored {
                    // Cancelled while the last node was running
                    self.runs.record_cancelled(run_id, report.log.joined(), node_executions, finished_at).await?;
                    tracing::info!("🛑 Run {} was cancelled before its result could be stored", run_id);
                    return Ok(ProcessOutcome::Cancelled);
                }

                // Run is already settled; usage errors are logged only
                if let Err(e) = self.usage.record_run(&run.workspace_id, node_executions).await {
                    tracing::error!("❌ Failed to record usage for run {}: {:#}", run_id, e);
                }

                tracing::info!("✅ Run {} succeeded ({} nodes)", run_id, node_executions);
                Ok(ProcessOutcome::Succeeded { node_executions })
            }
            Ok(ExecutionOutcome::Cancelled { next_node, report }) => {
                self.runs.record_cancelled(run_id, report.log.joined(), report.node_executions, Utc::now()).await?;
                tracing::info!("🛑 Run {} cancelled before node {}", run_id, next_node);
                Ok(ProcessOutcome::Cancelled)
            }
            Err(failure) => {
                let message = failure.error.to_string();
                let error = anyhow::Error::new(failure.error);
                let logs = format!("{}\n{:?}", failure.report.log.joined(), error);
                self.fail_run(run_id, started_at, message, logs, failure.report.node_executions).await?;
                Err(error)
            }
        }
    }

    /// Process a run under the job's wall clock
    pub async fn process_with_timeout(&self, run_id: &str, timeout: Duration) -> Result<ProcessOutcome> {
        match tokio::time::timeout(timeout, self.process(run_id)).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("Run timed out after {} ms", timeout.as_millis());
                tracing::error!("⏰ Run {}: {}", run_id, message);

                let started_at = self.runs.get_run(run_id).await?
                    .and_then(|run| run.started_at)
                    .unwrap_or_else(Utc::now);
                self.fail_run(run_id, started_at, message.clone(), message.clone(), 0).await?;
                Err(anyhow::anyhow!(message))
            }
        }
    }

    async fn fail_run(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        error_message: String,
        logs: String,
        node_executions: u64,
    ) -> Result<()> {
        let finished_at = Utc::now();
        tracing::error!("❌ Run {} failed: {}", run_id, error_message);

        let stored = self.runs.mark_failed(run_id, RunFailure {
            finished_at,
            duration_ms: Some(elapsed_ms(started_at, finished_at)),
            error_message,
            logs,
            node_executions,
        }).await?;

        if !stored {
            tracing::warn!("⚠️ Run {} left running state before failure was recorded", run_id);
        }
        Ok(())
    }
}

/// Queue consumers driving a `RunWorker`
pub struct WorkerPool {
    worker: Arc<RunWorker>,
    queue: JobQueue,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(worker: Arc<RunWorker>, queue: JobQueue, config: WorkerConfig) -> Self {
        Self { worker, queue, config }
    }

    /// Start the consumer loops and the stall sweeper in the background
    pub fn start(self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tracing::info!("👷 Starting worker pool with {} consumer(s)", self.config.concurrency.max(1));

        for consumer_id in 0..self.config.concurrency.max(1) {
            let consumer = Consumer {
                id: consumer_id,
                worker: Arc::clone(&self.worker),
                queue: self.queue.clone(),
                poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
            };
            tasks.spawn(consumer.run(cancellation_token.child_token()));
        }

        tasks.spawn(sweep_stalled(self.queue.clone(), cancellation_token.child_token()));

        WorkerHandle { tasks, cancellation_token }
    }
}

/// Handle for stopping a running pool
pub struct WorkerHandle {
    tasks: JoinSet<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stop claiming jobs and wait for in-flight jobs to finish
    pub async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        while self.tasks.join_next().await.is_some() {}
        tracing::info!("👷 Worker pool stopped");
    }
}

struct Consumer {
    id: usize,
    worker: Arc<RunWorker>,
    queue: JobQueue,
    poll_interval: Duration,
}

impl Consumer {
    async fn run(self, shutdown: CancellationToken) {
        tracing::debug!("Consumer {} started", self.id);

        while !shutdown.is_cancelled() {
            match self.queue.claim_next().await {
                Ok(Some(job)) => self.handle(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.wait_for_job(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("❌ Consumer {} failed to claim a job: {:#}", self.id, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        tracing::debug!("Consumer {} stopped", self.id);
    }

    async fn handle(&self, job: Job) {
        let config = self.queue.config();
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(keep_alive(
            self.queue.clone(),
            job.clone(),
            (config.stalled_interval() / 2).max(Duration::from_millis(10)),
            heartbeat_stop.clone(),
        ));

        let result = self.worker.process_with_timeout(&job.run_id, config.job_timeout()).await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        match result {
            Ok(outcome) => {
                tracing::debug!("Job {} finished: {:?}", job.id, outcome);
                if let Err(e) = self.queue.complete(&job).await {
                    tracing::error!("❌ Failed to complete job {}: {:#}", job.id, e);
                }
            }
            Err(error) => match self.queue.fail(&job, &format!("{:#}", error)).await {
                Ok(FailOutcome::LockLost) => {
                    tracing::warn!("⚠️ Job {} was recovered by the stall sweeper meanwhile", job.id);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("❌ Failed to record failure of job {}: {:#}", job.id, e),
            },
        }
    }
}

async fn keep_alive(queue: JobQueue, job: Job, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => match queue.heartbeat(&job).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("⚠️ Lost hold of job {}, stopping heartbeat", job.id);
                    break;
                }
                Err(e) => tracing::warn!("⚠️ Heartbeat for job {} failed: {:#}", job.id, e),
            },
        }
    }
}

async fn sweep_stalled(queue: JobQueue, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(queue.config().stalled_interval().max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.recover_stalled().await {
                    tracing::error!("❌ Stall sweep failed: {:#}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CyclePolicy, EngineConfig, QueueConfig};
    use crate::run::{SqliteRunStore, SqliteUsageLedger};
    use crate::runtime::executor::NodeExecutor;
    use crate::store::Database;
    use crate::workflow::{StoredWorkflow, WorkflowStorage};
    use serde_json::{json, Value};

    struct Fixture {
        pool: sqlx::SqlitePool,
        runs: Arc<SqliteRunStore>,
        workflows: Arc<WorkflowStorage>,
        usage: Arc<SqliteUsageLedger>,
        worker: RunWorker,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let runs = Arc::new(SqliteRunStore::new(db.pool().clone()));
        let workflows = Arc::new(WorkflowStorage::new(db.pool().clone()));
        let usage = Arc::new(SqliteUsageLedger::new(db.pool().clone()));
        let executor = Arc::new(NodeExecutor::new(Duration::from_secs(2)).unwrap());
        let engine = Arc::new(ExecutionEngine::new(executor, EngineConfig {
            http_timeout_ms: 2_000,
            cycle_policy: CyclePolicy::Reject,
            cancellation_checks: true,
        }));
        let worker = RunWorker::new(runs.clone(), workflows.clone(), usage.clone(), engine);
        Fixture { pool: db.pool().clone(), runs, workflows, usage, worker }
    }

    async fn save(fx: &Fixture, id: &str, definition: Value) {
        fx.workflows.save_workflow(&StoredWorkflow {
            id: id.to_string(),
            workspace_id: "ws-1".to_string(),
            name: id.to_string(),
            definition,
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_run_records_output_and_usage() {
        let fx = fixture().await;
        save(&fx, "wf", json!({
            "nodes": [
                {"name": "Hook", "type": "n8n-nodes-base.webhook"},
                {"name": "Set", "type": "n8n-nodes-base.set", "parameters": {"values": {"b": 2}}}
            ],
            "connections": {"Hook": {"main": [{"node": "Set"}]}}
        })).await;
        let run = fx.runs.create_run("wf", "ws-1", json!({"a": 1})).await.unwrap();

        let outcome = fx.worker.process(&run.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Succeeded { node_executions: 2 });

        let stored = fx.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.output_data, Some(json!({"Hook": {"a": 1}, "Set": {"b": 2}})));
        assert_eq!(stored.node_executions, 2);
        assert!(stored.started_at.is_some() && stored.finished_at.is_some());
        assert!(stored.logs.unwrap().contains("Execution order: Hook → Set"));

        let usage = fx.usage.current_usage("ws-1").await.unwrap().unwrap();
        assert_eq!((usage.runs, usage.node_executions), (1, 2));
    }

    struct BrokenLedger;

    #[async_trait]
    impl UsageSink for BrokenLedger {
        async fn increment_usage(&self, _: &str, _: crate::run::UsageMetric, _: u64) -> Result<()> {
            anyhow::bail!("ledger offline")
        }
    }

    #[tokio::test]
    async fn test_usage_failure_keeps_run_succeeded() {
        let fx = fixture().await;
        save(&fx, "wf", json!({"nodes": [{"name": "Hook", "type": "n8n-nodes-base.webhook"}]})).await;
        let run = fx.runs.create_run("wf", "ws-1", json!({})).await.unwrap();

        let worker = RunWorker::new(fx.runs.clone(), fx.workflows.clone(), Arc::new(BrokenLedger), fx.worker.engine.clone());
        let outcome = worker.process(&run.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Succeeded { node_executions: 1 });

        let stored = fx.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert!(fx.usage.current_usage("ws-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_workflow_fails_run() {
        let fx = fixture().await;
        let run = fx.runs.create_run("ghost", "ws-1", json!({})).await.unwrap();

        let error = fx.worker.process(&run.id).await.unwrap_err();
        assert_eq!(error.to_string(), "Workflow ghost not found");

        let stored = fx.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Workflow ghost not found"));
        assert!(fx.usage.current_usage("ws-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_run_is_an_error() {
        let fx = fixture().await;
        assert!(fx.worker.process("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_redelivered_terminal_runs_are_skipped() {
        let fx = fixture().await;
        save(&fx, "wf", json!({"nodes": [{"name": "S", "type": "set"}]})).await;
        let run = fx.runs.create_run("wf", "ws-1", json!({})).await.unwrap();

        fx.worker.process(&run.id).await.unwrap();
        let first = fx.runs.get_run(&run.id).await.unwrap().unwrap();

        let again = fx.worker.process(&run.id).await.unwrap();
        assert_eq!(again, ProcessOutcome::Skipped(RunStatus::Success));
        let second = fx.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(first.finished_at, second.finished_at);

        let usage = fx.usage.current_usage("ws-1").await.unwrap().unwrap();
        assert_eq!(usage.runs, 1);

        let cancelled = fx.runs.create_run("wf", "ws-1", json!({})).await.unwrap();
        fx.runs.cancel_run(&cancelled.id).await.unwrap();
        assert_eq!(
            fx.worker.process(&cancelled.id).await.unwrap(),
            ProcessOutcome::Skipped(RunStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_failed_run_is_retried_from_scratch() {
        let fx = fixture().await;
        let run = fx.runs.create_run("later", "ws-1", json!({})).await.unwrap();
        assert!(fx.worker.process(&run.id).await.is_err());

        save(&fx, "later", json!({"nodes": [{"name": "S", "type": "set"}]})).await;
        let outcome = fx.worker.process(&run.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Succeeded { node_executions: 1 });

        let stored = fx.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_cyclic_workflow_fails_without_usage() {
        let fx = fixture().await;
        save(&fx, "loop", json!({
            "nodes": [{"name": "X", "type": "set"}, {"name": "Y", "type": "set"}],
            "connections": {"X": {"main": [{"node": "Y"}]}, "Y": {"main": [{"node": "X"}]}}
        })).await;
        let run = fx.runs.create_run("loop", "ws-1", json!({})).await.unwrap();

        assert!(fx.worker.process(&run.id).await.is_err());
        let stored = fx.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Workflow graph contains a cycle through: X, Y"));
        assert!(fx.usage.current_usage("ws-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let fx = fixture().await;
        save(&fx, "wf", json!({"nodes": [{"name": "S", "type": "set"}]})).await;
        let queue = JobQueue::new(fx.pool.clone(), QueueConfig {
            attempts: 1,
            backoff_ms: 0,
            remove_on_complete: None,
            remove_on_fail: None,
            job_timeout_ms: 10_000,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
        });

        let run = fx.runs.create_run("wf", "ws-1", json!({})).await.unwrap();
        let job_id = queue.enqueue(&run.id).await.unwrap();

        let handle = WorkerPool::new(
            Arc::new(fx.worker.clone()),
            queue.clone(),
            WorkerConfig { concurrency: 2, poll_interval_ms: 20 },
        ).start();

        let mut completed = false;
        for _ in 0..200 {
            if queue.get(job_id).await.unwrap().map(|job| job.state) == Some(crate::queue::JobState::Completed) {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        handle.shutdown().await;

        assert!(completed);
        let stored = fx.runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
    }
}
