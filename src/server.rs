/// Server setup and initialization
///
/// Wires together all components: storage, queue, execution engine, worker pool and
/// HTTP routes. Every collaborator is constructed here and injected explicitly.

use crate::{
    api::{create_run_routes, create_workflow_routes, AppState},
    config::Config,
    queue::JobQueue,
    run::{SqliteRunStore, SqliteUsageLedger},
    runtime::{ExecutionEngine, NodeExecutor, RunWorker, WorkerPool},
    store::Database,
    workflow::WorkflowStorage,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Everything the server runs, built but not started
pub struct Services {
    pub state: AppState,
    pub worker_pool: WorkerPool,
}

/// Build the component graph on top of an open database
pub fn build_services(config: &Config, database: &Database) -> Result<Services> {
    let pool = database.pool().clone();

    tracing::info!("📋 Initializing workflow, run and usage storage");
    let workflows = WorkflowStorage::new(pool.clone());
    let runs = Arc::new(SqliteRunStore::new(pool.clone()));
    let usage = Arc::new(SqliteUsageLedger::new(pool.clone()));

    tracing::info!("⚙️ Initializing node executor");
    let node_executor = NodeExecutor::new(Duration::from_millis(config.engine.http_timeout_ms))
        .map_err(|e| anyhow::anyhow!("Failed to initialize node executor: {}", e))?;

    tracing::info!("🚀 Initializing execution engine");
    let execution_engine = Arc::new(ExecutionEngine::new(Arc::new(node_executor), config.engine.clone()));

    tracing::info!("📬 Initializing job queue");
    let queue = JobQueue::new(pool, config.queue.clone());

    let worker = Arc::new(RunWorker::new(
        runs.clone(),
        Arc::new(workflows.clone()),
        usage,
        execution_engine,
    ));
    let worker_pool = WorkerPool::new(worker, queue.clone(), config.worker.clone());

    Ok(Services {
        state: AppState { workflows, runs, queue },
        worker_pool,
    })
}

/// Create the HTTP router over the shared state
pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_run_routes())
        .with_state(state)
}

/// Start the HTTP server and the worker pool with the given configuration
///
/// Runs until ctrl-c, then stops accepting requests and lets in-flight jobs finish.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting runloom server...");

    tracing::info!("📁 Opening database in {}", config.database.data_dir);
    let database = Database::open(&config.database).await?;

    let services = build_services(&config, &database)?;
    let workers = services.worker_pool.start();
    let app = create_app(services.state);

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    let shutdown = workers.cancellation_token().clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("🛑 Shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    workers.shutdown().await;
    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
