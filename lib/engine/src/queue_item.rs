//! Queue items.
//!
//! A queue item pairs one event with one downstream node. The router creates
//! at most one per `(event, node)`; its ID is the idempotency key for the
//! execution it leads to.

use crate::event::Event;
use chrono::{DateTime, Utc};
use conveyor_core::{EventId, NodeId, QueueItemId, WorkflowId};
use serde::{Deserialize, Serialize};

/// A scheduled unit of work: deliver one event to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier.
    pub id: QueueItemId,
    /// Workflow the item belongs to.
    pub workflow_id: WorkflowId,
    /// Destination node.
    pub node_id: NodeId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Root of the event being delivered.
    pub root_event_id: EventId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the item was handed to the transport; `None` until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Creates an unpublished queue item delivering `event` to `node_id`.
    #[must_use]
    pub fn for_event(event: &Event, node_id: NodeId) -> Self {
        Self {
            id: QueueItemId::new(),
            workflow_id: event.workflow_id,
            node_id,
            event_id: event.id,
            root_event_id: event.root_event_id,
            created_at: Utc::now(),
            published_at: None,
        }
    }

    /// Returns true once the item has been published.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}
