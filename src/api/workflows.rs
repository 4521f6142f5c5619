/// Workflow definition endpoints
///
/// Stores n8n-style workflow documents as-is. Definitions are validated by parsing
/// them into a graph before they are saved, so the worker never sees a document it
/// cannot execute structurally.

use crate::{
    api::AppState,
    workflow::{StoredWorkflow, WorkflowGraph, WorkflowSource},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response for workflow save operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Request body for saving a workflow
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveWorkflowRequest {
    pub workspace_id: String,
    /// Display name; defaults to the document's own `name`
    pub name: Option<String>,
    pub definition: Value,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}", get(get_workflow).put(save_workflow))
}

/// Create or replace a workflow
///
/// PUT /api/workflows/{id}
/// Body: { "workspaceId": "...", "definition": { "nodes": [...], "connections": {...} } }
async fn save_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SaveWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    if payload.workspace_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let graph = match WorkflowGraph::from_value(&payload.definition) {
        Ok(graph) => graph,
        Err(e) => {
            tracing::warn!("Rejected workflow {}: {}", id, e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let workflow = StoredWorkflow {
        id: id.clone(),
        workspace_id: payload.workspace_id,
        name: payload.name.unwrap_or(graph.name),
        definition: payload.definition,
    };

    if let Err(e) = state.workflows.save_workflow(&workflow).await {
        tracing::error!("Failed to save workflow {}: {}", id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    tracing::info!("💾 Saved workflow: {} ({}, {} nodes)", workflow.id, workflow.name, graph.nodes.len());

    Ok(Json(WorkflowResponse {
        id: workflow.id,
        message: format!("Workflow '{}' saved successfully", workflow.name),
    }))
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredWorkflow>, StatusCode> {
    match state.workflows.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
