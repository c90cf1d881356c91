//! Workflow lookups.

use super::{PgStore, parse_column};
use crate::error::store_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::WorkflowId;
use conveyor_engine::{StoreError, WorkflowStore};
use conveyor_workflow::Workflow;
use sqlx::FromRow;

/// Row type for workflow queries.
#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    organization_id: String,
    name: String,
    graph_data: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn try_into_workflow(self) -> Result<Workflow, StoreError> {
        let id: WorkflowId = parse_column("workflow id", &self.id).map_err(store_error)?;
        let organization_id =
            parse_column("organization id", &self.organization_id).map_err(store_error)?;
        let graph =
            Workflow::decode_graph(id, self.graph_data).map_err(|e| StoreError::Decode {
                message: e.to_string(),
            })?;

        Ok(Workflow {
            id,
            organization_id,
            name: self.name,
            graph,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn find_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, name, graph_data, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(WorkflowRow::try_into_workflow).transpose()
    }
}
