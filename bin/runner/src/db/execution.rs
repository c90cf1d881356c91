//! Executions and compare-and-set transitions.

use super::event::insert_event;
use super::{PgStore, limit, parse_column};
use crate::error::store_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{ExecutionId, QueueItemId};
use conveyor_engine::{
    CreateOutcome, Event, Execution, ExecutionOutput, ExecutionState, ExecutionStore, StoreError,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};

const EXECUTION_COLUMNS: &str = "id, workflow_id, node_id, queue_item_id, event_id, root_event_id, \
     state, input_data, output_data, error_message, created_at, updated_at";

/// Row type for execution queries.
#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    workflow_id: String,
    node_id: String,
    queue_item_id: String,
    event_id: String,
    root_event_id: String,
    state: String,
    input_data: serde_json::Value,
    output_data: Option<Json<ExecutionOutput>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    fn try_into_execution(self) -> Result<Execution, sqlx::Error> {
        Ok(Execution {
            id: parse_column("execution id", &self.id)?,
            workflow_id: parse_column("workflow id", &self.workflow_id)?,
            node_id: parse_column("node id", &self.node_id)?,
            queue_item_id: parse_column("queue item id", &self.queue_item_id)?,
            event_id: parse_column("event id", &self.event_id)?,
            root_event_id: parse_column("root event id", &self.root_event_id)?,
            state: parse_column("execution state", &self.state)?,
            input_data: self.input_data,
            output_data: self.output_data.map(|Json(output)| output),
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Writes state, output and error if the stored state is still `expected`.
async fn compare_and_set(
    conn: &mut PgConnection,
    execution: &Execution,
    expected: ExecutionState,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET state = $2, output_data = $3, error_message = $4, updated_at = $5
        WHERE id = $1 AND state = $6
        "#,
    )
    .bind(execution.id.to_string())
    .bind(execution.state.as_str())
    .bind(execution.output_data.as_ref().map(Json))
    .bind(&execution.error_message)
    .bind(execution.updated_at)
    .bind(expected.as_str())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

impl PgStore {
    async fn fetch_execution(
        &self,
        column: &str,
        value: String,
    ) -> Result<Option<Execution>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE {column} = $1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(ExecutionRow::try_into_execution)
            .transpose()
            .map_err(store_error)
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create_execution_if_absent(
        &self,
        execution: &Execution,
    ) -> Result<CreateOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO executions
                (id, workflow_id, node_id, queue_item_id, event_id, root_event_id,
                 state, input_data, output_data, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (queue_item_id) DO NOTHING
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.node_id.to_string())
        .bind(execution.queue_item_id.to_string())
        .bind(execution.event_id.to_string())
        .bind(execution.root_event_id.to_string())
        .bind(execution.state.as_str())
        .bind(&execution.input_data)
        .bind(execution.output_data.as_ref().map(Json))
        .bind(&execution.error_message)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if inserted.rows_affected() == 1 {
            return Ok(CreateOutcome::Created(execution.clone()));
        }

        self.find_execution_by_queue_item(execution.queue_item_id)
            .await?
            .map(CreateOutcome::Existing)
            .ok_or_else(|| StoreError::Unavailable {
                message: format!(
                    "execution for queue item {} vanished after conflict",
                    execution.queue_item_id
                ),
            })
    }

    async fn find_execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        self.fetch_execution("id", id.to_string()).await
    }

    async fn find_execution_by_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Option<Execution>, StoreError> {
        self.fetch_execution("queue_item_id", queue_item_id.to_string())
            .await
    }

    async fn transition_execution(
        &self,
        execution: &Execution,
        expected: ExecutionState,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        compare_and_set(&mut conn, execution, expected)
            .await
            .map_err(store_error)
    }

    async fn finish_execution(
        &self,
        execution: &Execution,
        expected: ExecutionState,
        events: &[Event],
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        if !compare_and_set(&mut tx, execution, expected)
            .await
            .map_err(store_error)?
        {
            // Dropping the transaction rolls it back.
            return Ok(false);
        }
        for event in events {
            insert_event(&mut tx, event).await.map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;
        Ok(true)
    }

    async fn touch_execution(
        &self,
        id: ExecutionId,
        expected: ExecutionState,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE executions SET updated_at = $3 WHERE id = $1 AND state = $2")
            .bind(id.to_string())
            .bind(expected.as_str())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_executions(
        &self,
        state: ExecutionState,
        updated_before: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM executions
            WHERE state = $1 AND updated_at < $2
            ORDER BY updated_at
            LIMIT $3
            "#
        ))
        .bind(state.as_str())
        .bind(updated_before)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(ExecutionRow::try_into_execution)
            .collect::<Result<_, _>>()
            .map_err(store_error)
    }
}
