/// SQLite persistence layer for workflow definitions
///
/// Workflows are stored as their raw n8n-style JSON document. The engine only ever
/// reads them through the `WorkflowSource` trait; `save_workflow` exists for the API
/// layer and for seeding.

use crate::workflow::types::WorkflowGraph;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};

/// A stored workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredWorkflow {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// The document exactly as exported
    pub definition: Value,
}

impl StoredWorkflow {
    /// Build the execution graph from the stored document
    pub fn graph(&self) -> Result<WorkflowGraph> {
        WorkflowGraph::from_value(&self.definition)
    }
}

/// Read access to workflow definitions
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn get_workflow(&self, id: &str) -> Result<Option<StoredWorkflow>>;
}

/// SQLite-based workflow storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// SQLite connection pool
    pool: SqlitePool,
}

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new workflow or update existing one
    ///
    /// Uses UPSERT to handle both create and update operations atomically.
    pub async fn save_workflow(&self, workflow: &StoredWorkflow) -> Result<()> {
        let definition_json = serde_json::to_string(&workflow.definition)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, workspace_id, name, definition, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.workspace_id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Saved workflow: {} ({})", workflow.id, workflow.name);
        Ok(())
    }
}

#[async_trait]
impl WorkflowSource for WorkflowStorage {
    async fn get_workflow(&self, id: &str) -> Result<Option<StoredWorkflow>> {
        let row = sqlx::query("SELECT id, workspace_id, name, definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(StoredWorkflow {
                    id: row.get("id"),
                    workspace_id: row.get("workspace_id"),
                    name: row.get("name"),
                    definition: serde_json::from_str(&definition_json)?,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_then_update_workflow() {
        let db = Database::in_memory().await.unwrap();
        let storage = WorkflowStorage::new(db.pool().clone());

        let mut workflow = StoredWorkflow {
            id: "wf-1".into(),
            workspace_id: "ws-1".into(),
            name: "First".into(),
            definition: json!({"name": "First", "nodes": []}),
        };
        storage.save_workflow(&workflow).await.unwrap();

        workflow.name = "Renamed".into();
        workflow.definition = json!({"name": "Renamed", "nodes": [{"name": "A", "type": "set"}]});
        storage.save_workflow(&workflow).await.unwrap();

        let loaded = storage.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Renamed");
        assert_eq!(loaded.graph().unwrap().nodes.len(), 1);
        assert!(storage.get_workflow("missing").await.unwrap().is_none());
    }
}
