/// runloom: queued workflow execution engine
///
/// Main entry point. Loads configuration from the environment and starts the HTTP
/// API together with the background worker pool.

use runloom::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow definitions at /api/workflows/{id}
/// - Run creation, inspection and cancellation at /api/workflows/{id}/runs and /api/runs/*
/// - Queue statistics at /api/queue/stats
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and data/runloom.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
