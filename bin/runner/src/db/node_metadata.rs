//! Trigger node metadata.

use super::PgStore;
use crate::error::store_error;
use async_trait::async_trait;
use conveyor_core::{NodeId, WorkflowId};
use conveyor_engine::{NodeMetadataStore, StoreError};
use serde_json::Value as JsonValue;

#[async_trait]
impl NodeMetadataStore for PgStore {
    async fn find_node_metadata(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<Option<JsonValue>, StoreError> {
        let row: Option<(JsonValue,)> = sqlx::query_as(
            r#"
            SELECT metadata
            FROM node_metadata
            WHERE workflow_id = $1 AND node_id = $2
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(node_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(row.map(|(metadata,)| metadata))
    }

    async fn save_node_metadata(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
        metadata: &JsonValue,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO node_metadata (workflow_id, node_id, metadata, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (workflow_id, node_id)
            DO UPDATE SET metadata = EXCLUDED.metadata, updated_at = NOW()
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(node_id.to_string())
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }
}
