//! Queue items and the publish outbox.

use super::{PgStore, limit, parse_column};
use crate::error::store_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::QueueItemId;
use conveyor_engine::{QueueItem, QueueItemStore, StoreError};
use sqlx::{FromRow, PgConnection};

pub(super) const QUEUE_ITEM_COLUMNS: &str =
    "id, workflow_id, node_id, event_id, root_event_id, created_at, published_at";

/// Row type for queue item queries.
#[derive(FromRow)]
pub(super) struct QueueItemRow {
    id: String,
    workflow_id: String,
    node_id: String,
    event_id: String,
    root_event_id: String,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl QueueItemRow {
    pub(super) fn try_into_queue_item(self) -> Result<QueueItem, sqlx::Error> {
        Ok(QueueItem {
            id: parse_column("queue item id", &self.id)?,
            workflow_id: parse_column("workflow id", &self.workflow_id)?,
            node_id: parse_column("node id", &self.node_id)?,
            event_id: parse_column("event id", &self.event_id)?,
            root_event_id: parse_column("root event id", &self.root_event_id)?,
            created_at: self.created_at,
            published_at: self.published_at,
        })
    }
}

/// Inserts a queue item unless its `(event, node)` pair already exists.
pub(super) async fn insert_queue_item(
    conn: &mut PgConnection,
    item: &QueueItem,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO queue_items
            (id, workflow_id, node_id, event_id, root_event_id, created_at, published_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (event_id, node_id) DO NOTHING
        "#,
    )
    .bind(item.id.to_string())
    .bind(item.workflow_id.to_string())
    .bind(item.node_id.to_string())
    .bind(item.event_id.to_string())
    .bind(item.root_event_id.to_string())
    .bind(item.created_at)
    .bind(item.published_at)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl QueueItemStore for PgStore {
    async fn find_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        let row: Option<QueueItemRow> = sqlx::query_as(&format!(
            "SELECT {QUEUE_ITEM_COLUMNS} FROM queue_items WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(QueueItemRow::try_into_queue_item)
            .transpose()
            .map_err(store_error)
    }

    async fn list_unpublished(
        &self,
        created_before: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            r#"
            SELECT {QUEUE_ITEM_COLUMNS}
            FROM queue_items
            WHERE published_at IS NULL AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(created_before)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(QueueItemRow::try_into_queue_item)
            .collect::<Result<_, _>>()
            .map_err(store_error)
    }

    async fn list_unexecuted(
        &self,
        published_before: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            r#"
            SELECT {QUEUE_ITEM_COLUMNS}
            FROM queue_items
            WHERE published_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM executions
                  WHERE executions.queue_item_id = queue_items.id
              )
            ORDER BY published_at
            LIMIT $2
            "#
        ))
        .bind(published_before)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(QueueItemRow::try_into_queue_item)
            .collect::<Result<_, _>>()
            .map_err(store_error)
    }

    async fn mark_published(&self, id: QueueItemId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE queue_items SET published_at = $2 WHERE id = $1")
        .bind(id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }
}
