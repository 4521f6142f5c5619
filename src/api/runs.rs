/// Run endpoints
///
/// Creating a run only persists it as `queued` and enqueues a job; execution happens
/// in the worker pool. Cancellation flips the run status and drops any job that is
/// still waiting for it.

use crate::{
    api::AppState,
    run::{CancelOutcome, Run, RunFilter},
    workflow::WorkflowSource,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal(context: &str, e: anyhow::Error) -> ApiError {
    tracing::error!("{}: {:#}", context, e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, context)
}

/// Optional body of a run request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    #[serde(default)]
    pub input_data: Option<Value>,
}

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/runs", post(create_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/queue/stats", get(queue_stats))
}

/// Queue a run of a workflow
///
/// POST /api/workflows/{id}/runs
/// Body (optional): { "inputData": {...} }
/// Returns: 201 { "runId": "...", "status": "queued" }
async fn create_run(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: CreateRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateRunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e)))?
    };

    let workflow = match state.workflows.get_workflow(&workflow_id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return Err(api_error(StatusCode::NOT_FOUND, format!("Workflow {} not found", workflow_id))),
        Err(e) => return Err(internal("Failed to load workflow", e)),
    };

    let input_data = request.input_data.unwrap_or_else(|| json!({}));
    let run = state.runs.create_run(&workflow.id, &workflow.workspace_id, input_data).await
        .map_err(|e| internal("Failed to create run", e))?;

    state.queue.enqueue(&run.id).await
        .map_err(|e| internal("Failed to enqueue run", e))?;

    Ok((StatusCode::CREATED, Json(json!({ "runId": run.id, "status": run.status }))))
}

/// GET /api/runs?workspaceId=&status=&workflowId=&page=&limit=
async fn list_runs(
    State(state): State<AppState>,
    Query(filter): Query<RunFilter>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.runs.list_runs(&filter).await
        .map_err(|e| internal("Failed to list runs", e))?;
    let (limit, _) = filter.window();

    Ok(Json(json!({
        "runs": runs,
        "page": filter.page.unwrap_or(1).max(1),
        "limit": limit,
    })))
}

/// GET /api/runs/{id}
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    match state.runs.get_run(&id).await {
        Ok(Some(run)) => Ok(Json(run)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "Run not found")),
        Err(e) => Err(internal("Failed to get run", e)),
    }
}

/// POST /api/runs/{id}/cancel
async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    match state.runs.cancel_run(&id).await {
        Ok(CancelOutcome::Cancelled(run)) => {
            state.queue.cancel_waiting(&run.id).await
                .map_err(|e| internal("Failed to drop queued job", e))?;
            Ok(Json(run))
        }
        Ok(CancelOutcome::NotCancellable(status)) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Run cannot be cancelled in status {}", status),
        )),
        Ok(CancelOutcome::NotFound) => Err(api_error(StatusCode::NOT_FOUND, "Run not found")),
        Err(e) => Err(internal("Failed to cancel run", e)),
    }
}

/// GET /api/queue/stats
async fn queue_stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let counts = state.queue.stats().await
        .map_err(|e| internal("Failed to read queue stats", e))?;
    Ok(Json(json!(counts)))
}
