//! Durable store contracts.
//!
//! The router, worker and executor share state only through these traits.
//! Every mutation is scoped to a single atomic write: claiming events,
//! routing an event together with its queue items, and compare-and-set
//! execution transitions.

use crate::error::StoreError;
use crate::event::Event;
use crate::execution::{Execution, ExecutionState};
use crate::queue_item::QueueItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{EventId, ExecutionId, NodeId, QueueItemId, WorkflowId};
use conveyor_workflow::Workflow;
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Read access to workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Loads a workflow with its graph ready for lookups.
    async fn find_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError>;
}

/// Event persistence and routing.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts a new event.
    async fn create_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Inserts several events in one atomic write; either all or none are
    /// stored.
    async fn create_events(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Loads an event.
    async fn find_event(&self, id: EventId) -> Result<Option<Event>, StoreError>;

    /// Claims up to `limit` pending events, oldest first.
    ///
    /// A claimed event is invisible to other claimers until `lease` elapses
    /// or it is released.
    async fn claim_pending_events(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Event>, StoreError>;

    /// Gives up a claim so the event can be picked up again.
    async fn release_event(&self, id: EventId) -> Result<(), StoreError>;

    /// Creates queue items and marks the event routed in one atomic write.
    ///
    /// Items whose `(event, node)` pair already exists are skipped. Returns
    /// every queue item that exists for the event afterwards, including ones
    /// left by an earlier interrupted attempt.
    async fn route_event(
        &self,
        event_id: EventId,
        items: Vec<QueueItem>,
    ) -> Result<Vec<QueueItem>, StoreError>;
}

/// Queue item bookkeeping for the outbox.
#[async_trait]
pub trait QueueItemStore: Send + Sync {
    /// Loads a queue item.
    async fn find_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError>;

    /// Lists items never published and created before `created_before`.
    async fn list_unpublished(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Lists items published before `published_before` that still have no
    /// execution.
    async fn list_unexecuted(
        &self,
        published_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Records the latest hand-off of an item to the transport.
    async fn mark_published(&self, id: QueueItemId, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Outcome of idempotent execution creation.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The execution was inserted.
    Created(Execution),
    /// An execution for the queue item already existed; it is returned as
    /// stored.
    Existing(Execution),
}

impl CreateOutcome {
    /// Returns the stored execution either way.
    #[must_use]
    pub fn into_execution(self) -> Execution {
        match self {
            Self::Created(execution) | Self::Existing(execution) => execution,
        }
    }
}

/// Execution persistence.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts the execution unless one already exists for its queue item.
    async fn create_execution_if_absent(
        &self,
        execution: &Execution,
    ) -> Result<CreateOutcome, StoreError>;

    /// Loads an execution.
    async fn find_execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError>;

    /// Loads the execution created for a queue item.
    async fn find_execution_by_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Option<Execution>, StoreError>;

    /// Writes the execution's state, output and error if the stored state is
    /// still `expected`. Returns false when another writer got there first.
    async fn transition_execution(
        &self,
        execution: &Execution,
        expected: ExecutionState,
    ) -> Result<bool, StoreError>;

    /// Like `transition_execution`, and inserts `events` in the same write.
    async fn finish_execution(
        &self,
        execution: &Execution,
        expected: ExecutionState,
        events: &[Event],
    ) -> Result<bool, StoreError>;

    /// Bumps `updated_at` if the stored state is still `expected`. Returns
    /// false when the execution has moved on.
    async fn touch_execution(
        &self,
        id: ExecutionId,
        expected: ExecutionState,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Lists executions in `state` not updated since `updated_before`.
    async fn list_executions(
        &self,
        state: ExecutionState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;
}

/// Provisioning state recorded by trigger setup.
#[async_trait]
pub trait NodeMetadataStore: Send + Sync {
    /// Loads the metadata recorded for a node.
    async fn find_node_metadata(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<Option<JsonValue>, StoreError>;

    /// Replaces the metadata recorded for a node.
    async fn save_node_metadata(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
        metadata: &JsonValue,
    ) -> Result<(), StoreError>;
}

/// Everything the engine needs from a durable store.
pub trait Store:
    WorkflowStore + EventStore + QueueItemStore + ExecutionStore + NodeMetadataStore
{
}

impl<T> Store for T where
    T: WorkflowStore + EventStore + QueueItemStore + ExecutionStore + NodeMetadataStore
{
}
