//! Events, claiming and the routing write.

use super::queue_item::{QUEUE_ITEM_COLUMNS, QueueItemRow, insert_queue_item};
use super::{PgStore, limit, parse_column};
use crate::error::store_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::EventId;
use conveyor_engine::{Event, EventStore, QueueItem, StoreError};
use sqlx::{FromRow, PgConnection};
use std::time::Duration;

/// Row type for event queries.
#[derive(FromRow)]
struct EventRow {
    id: String,
    workflow_id: String,
    node_id: String,
    channel: String,
    event_type: String,
    data: serde_json::Value,
    state: String,
    root_event_id: String,
    execution_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event, sqlx::Error> {
        let execution_id = self
            .execution_id
            .as_deref()
            .map(|id| parse_column("execution id", id))
            .transpose()?;

        Ok(Event {
            id: parse_column("event id", &self.id)?,
            workflow_id: parse_column("workflow id", &self.workflow_id)?,
            node_id: parse_column("node id", &self.node_id)?,
            channel: self.channel,
            event_type: self.event_type,
            data: self.data,
            state: parse_column("event state", &self.state)?,
            root_event_id: parse_column("root event id", &self.root_event_id)?,
            execution_id,
            created_at: self.created_at,
        })
    }
}

/// Inserts a pending event.
pub(super) async fn insert_event(conn: &mut PgConnection, event: &Event) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO events
            (id, workflow_id, node_id, channel, event_type, data, state,
             root_event_id, execution_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(event.id.to_string())
    .bind(event.workflow_id.to_string())
    .bind(event.node_id.to_string())
    .bind(&event.channel)
    .bind(&event.event_type)
    .bind(&event.data)
    .bind(event.state.as_str())
    .bind(event.root_event_id.to_string())
    .bind(event.execution_id.map(|id| id.to_string()))
    .bind(event.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl EventStore for PgStore {
    async fn create_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        insert_event(&mut conn, event).await.map_err(store_error)
    }

    async fn create_events(&self, events: &[Event]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        for event in events {
            insert_event(&mut tx, event).await.map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)
    }

    async fn find_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, node_id, channel, event_type, data, state,
                   root_event_id, execution_id, created_at
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(EventRow::try_into_event)
            .transpose()
            .map_err(store_error)
    }

    async fn claim_pending_events(
        &self,
        max: usize,
        lease: Duration,
    ) -> Result<Vec<Event>, StoreError> {
        // Rows another router is claiming are skipped; the lease hides
        // claimed rows once this statement commits.
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            UPDATE events
            SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id
                FROM events
                WHERE state = 'pending'
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, workflow_id, node_id, channel, event_type, data, state,
                      root_event_id, execution_id, created_at
            "#,
        )
        .bind(limit(max))
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let mut events = rows
            .into_iter()
            .map(EventRow::try_into_event)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }

    async fn release_event(&self, id: EventId) -> Result<(), StoreError> {
        sqlx::query("UPDATE events SET claimed_until = NULL WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(())
    }

    async fn route_event(
        &self,
        event_id: EventId,
        items: Vec<QueueItem>,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        for item in &items {
            insert_queue_item(&mut tx, item).await.map_err(store_error)?;
        }

        sqlx::query(
            r#"
            UPDATE events
            SET state = 'routed', claimed_until = NULL
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(event_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            "SELECT {QUEUE_ITEM_COLUMNS} FROM queue_items WHERE event_id = $1"
        ))
        .bind(event_id.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;

        let mut routed = rows
            .into_iter()
            .map(QueueItemRow::try_into_queue_item)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;

        // Hand items back in edge declaration order.
        routed.sort_by_key(|stored| {
            items
                .iter()
                .position(|item| item.node_id == stored.node_id)
                .unwrap_or(usize::MAX)
        });
        Ok(routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{ExecutionId, NodeId, WorkflowId};
    use conveyor_engine::EventState;

    #[test]
    fn decodes_derived_event_row() {
        let id = EventId::new();
        let root = EventId::new();
        let execution_id = ExecutionId::new();
        let row = EventRow {
            id: id.to_string(),
            workflow_id: WorkflowId::new().to_string(),
            node_id: NodeId::new().to_string(),
            channel: "passed".to_string(),
            event_type: "gate.passed".to_string(),
            data: serde_json::json!({"ok": true}),
            state: "routed".to_string(),
            root_event_id: root.to_string(),
            execution_id: Some(execution_id.to_string()),
            created_at: Utc::now(),
        };

        let event = row.try_into_event().unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.root_event_id, root);
        assert_eq!(event.execution_id, Some(execution_id));
        assert_eq!(event.state, EventState::Routed);
    }

    #[test]
    fn unknown_state_fails_decode() {
        let row = EventRow {
            id: EventId::new().to_string(),
            workflow_id: WorkflowId::new().to_string(),
            node_id: NodeId::new().to_string(),
            channel: "default".to_string(),
            event_type: "manual".to_string(),
            data: serde_json::Value::Null,
            state: "lost".to_string(),
            root_event_id: EventId::new().to_string(),
            execution_id: None,
            created_at: Utc::now(),
        };
        assert!(row.try_into_event().is_err());
    }
}
