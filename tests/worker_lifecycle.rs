use async_trait::async_trait;
use runloom::{
    config::{CyclePolicy, EngineConfig, QueueConfig, WorkerConfig},
    queue::{JobQueue, JobState},
    run::{RunStatus, RunStore, SqliteRunStore, SqliteUsageLedger},
    runtime::{ExecutionEngine, ExecutionLog, NodeExecutor, NodeHandler, NodeInput, ProcessOutcome, RunWorker, WorkerPool},
    store::Database,
    workflow::{Node, NodeKind, StoredWorkflow, WorkflowStorage},
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

struct Harness {
    queue: JobQueue,
    runs: Arc<SqliteRunStore>,
    workflows: WorkflowStorage,
    usage: Arc<SqliteUsageLedger>,
    worker: Arc<RunWorker>,
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        attempts: 2,
        backoff_ms: 10,
        remove_on_complete: Some(100),
        remove_on_fail: None,
        job_timeout_ms: 10_000,
        stalled_interval_ms: 30_000,
        max_stalled_count: 1,
    }
}

async fn harness_with(executor: NodeExecutor) -> Harness {
    let database = Database::in_memory().await.unwrap();
    let pool = database.pool().clone();

    let runs = Arc::new(SqliteRunStore::new(pool.clone()));
    let workflows = WorkflowStorage::new(pool.clone());
    let usage = Arc::new(SqliteUsageLedger::new(pool.clone()));
    let engine = Arc::new(ExecutionEngine::new(Arc::new(executor), EngineConfig {
        http_timeout_ms: 2_000,
        cycle_policy: CyclePolicy::Reject,
        cancellation_checks: true,
    }));
    let worker = Arc::new(RunWorker::new(runs.clone(), Arc::new(workflows.clone()), usage.clone(), engine));

    Harness {
        queue: JobQueue::new(pool, queue_config()),
        runs,
        workflows,
        usage,
        worker,
    }
}

async fn harness() -> Harness {
    harness_with(NodeExecutor::new(Duration::from_secs(2)).unwrap()).await
}

async fn save(h: &Harness, id: &str, definition: Value) {
    h.workflows.save_workflow(&StoredWorkflow {
        id: id.to_string(),
        workspace_id: "ws-1".to_string(),
        name: id.to_string(),
        definition,
    }).await.unwrap();
}

async fn wait_for_job(queue: &JobQueue, job_id: i64, state: JobState) -> bool {
    for _ in 0..400 {
        if queue.get(job_id).await.unwrap().map(|job| job.state) == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn queued_run_executes_through_the_pool() {
    let h = harness().await;
    save(&h, "wf", json!({
        "name": "Chain",
        "nodes": [
            {"name": "Webhook", "type": "n8n-nodes-base.webhook"},
            {"name": "Set", "type": "n8n-nodes-base.set", "parameters": {"values": {"b": 2}}},
            {"name": "Branch", "type": "n8n-nodes-base.if"}
        ],
        "connections": {
            "Webhook": {"main": [{"node": "Set"}]},
            "Set": {"main": [{"node": "Branch"}]}
        }
    })).await;

    let run = h.runs.create_run("wf", "ws-1", json!({"a": 1})).await.unwrap();
    let job_id = h.queue.enqueue(&run.id).await.unwrap();

    let workers = WorkerPool::new(h.worker.clone(), h.queue.clone(), WorkerConfig {
        concurrency: 1,
        poll_interval_ms: 20,
    }).start();
    let completed = wait_for_job(&h.queue, job_id, JobState::Completed).await;
    workers.shutdown().await;
    assert!(completed);

    let stored = h.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.node_executions, 3);
    assert_eq!(stored.output_data.unwrap()["Branch"], json!({"b": 2, "conditionMet": true}));

    let usage = h.usage.current_usage("ws-1").await.unwrap().unwrap();
    assert_eq!((usage.runs, usage.node_executions), (1, 3));
}

#[tokio::test]
async fn unreachable_http_node_fails_after_retries() {
    let h = harness().await;
    save(&h, "wf", json!({
        "nodes": [
            {"name": "Hook", "type": "n8n-nodes-base.webhook"},
            {"name": "Call API", "type": "n8n-nodes-base.httpRequest", "parameters": {"url": "http://127.0.0.1:1/"}}
        ],
        "connections": {"Hook": {"main": [{"node": "Call API"}]}}
    })).await;

    let run = h.runs.create_run("wf", "ws-1", json!({})).await.unwrap();
    let job_id = h.queue.enqueue(&run.id).await.unwrap();

    let workers = WorkerPool::new(h.worker.clone(), h.queue.clone(), WorkerConfig {
        concurrency: 1,
        poll_interval_ms: 20,
    }).start();
    let failed = wait_for_job(&h.queue, job_id, JobState::Failed).await;
    workers.shutdown().await;
    assert!(failed);

    let job = h.queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 2);
    assert!(job.last_error.unwrap().starts_with("Node Call API failed"));

    let stored = h.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.error_message.unwrap().starts_with("Node Call API failed: HTTP request failed"));
    assert_eq!(stored.node_executions, 2);
    assert!(stored.finished_at.is_some());
    assert!(stored.duration_ms.is_some());
    assert!(stored.output_data.is_none());
    assert!(stored.logs.unwrap().contains("❌ Node failed: Call API"));
    assert!(h.usage.current_usage("ws-1").await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_node_type_counts_as_executed() {
    let h = harness().await;
    save(&h, "wf", json!({"nodes": [{"name": "Thing", "type": "CustomThing99"}]})).await;
    let run = h.runs.create_run("wf", "ws-1", json!({})).await.unwrap();

    let outcome = h.worker.process(&run.id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Succeeded { node_executions: 1 });

    let stored = h.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(
        stored.output_data.unwrap()["Thing"]["message"],
        "Node type CustomThing99 not yet implemented"
    );
}

/// Cancels the run it belongs to while executing, like a user hitting cancel mid-run
struct CancelsItsRun {
    runs: Arc<SqliteRunStore>,
}

#[async_trait]
impl NodeHandler for CancelsItsRun {
    async fn execute(&self, _node: &Node, _input: &NodeInput, log: &mut ExecutionLog) -> anyhow::Result<Value> {
        let queued = self.runs.list_runs(&Default::default()).await?;
        for run in queued {
            self.runs.cancel_run(&run.id).await?;
        }
        log.push("  Requested cancellation");
        Ok(json!({}))
    }
}

#[tokio::test]
async fn cancellation_mid_run_stops_before_next_node() {
    let database = Database::in_memory().await.unwrap();
    let runs = Arc::new(SqliteRunStore::new(database.pool().clone()));
    let executor = NodeExecutor::new(Duration::from_secs(2)).unwrap()
        .with_handler(&NodeKind::Slack, Arc::new(CancelsItsRun { runs: runs.clone() }));

    let workflows = WorkflowStorage::new(database.pool().clone());
    let usage = Arc::new(SqliteUsageLedger::new(database.pool().clone()));
    let engine = Arc::new(ExecutionEngine::new(Arc::new(executor), EngineConfig {
        http_timeout_ms: 2_000,
        cycle_policy: CyclePolicy::Reject,
        cancellation_checks: true,
    }));
    let worker = RunWorker::new(runs.clone(), Arc::new(workflows.clone()), usage.clone(), engine);

    workflows.save_workflow(&StoredWorkflow {
        id: "wf".to_string(),
        workspace_id: "ws-1".to_string(),
        name: "wf".to_string(),
        definition: json!({
            "nodes": [
                {"name": "Notify", "type": "n8n-nodes-base.slack"},
                {"name": "After", "type": "n8n-nodes-base.set"}
            ],
            "connections": {"Notify": {"main": [{"node": "After"}]}}
        }),
    }).await.unwrap();

    let run = runs.create_run("wf", "ws-1", json!({})).await.unwrap();
    assert_eq!(worker.process(&run.id).await.unwrap(), ProcessOutcome::Cancelled);

    let stored = runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Cancelled);
    assert_eq!(stored.node_executions, 1);
    assert!(stored.logs.unwrap().contains("Run cancelled before node: After"));
    assert!(usage.current_usage("ws-1").await.unwrap().is_none());
}

#[tokio::test]
async fn run_exceeding_its_wall_clock_is_failed() {
    struct Sleeper;

    #[async_trait]
    impl NodeHandler for Sleeper {
        async fn execute(&self, _node: &Node, _input: &NodeInput, _log: &mut ExecutionLog) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    let executor = NodeExecutor::new(Duration::from_secs(2)).unwrap()
        .with_handler(&NodeKind::Gmail, Arc::new(Sleeper));
    let h = harness_with(executor).await;
    save(&h, "wf", json!({"nodes": [{"name": "Mail", "type": "n8n-nodes-base.gmail"}]})).await;
    let run = h.runs.create_run("wf", "ws-1", json!({})).await.unwrap();

    let error = h.worker.process_with_timeout(&run.id, Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(error.to_string(), "Run timed out after 100 ms");

    let stored = h.runs.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("Run timed out after 100 ms"));
}
