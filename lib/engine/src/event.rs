//! Events.
//!
//! An event is data produced by a trigger or a finished execution. It starts
//! `pending` and becomes `routed` exactly once, in the same write that
//! creates queue items for its downstream nodes. Nothing else about an event
//! ever changes.

use crate::execution::Execution;
use chrono::{DateTime, Utc};
use conveyor_core::{EventId, ExecutionId, NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Routing state of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    /// Waiting for the router.
    Pending,
    /// Queue items exist for every downstream node.
    Routed,
}

impl EventState {
    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Routed => "routed",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "routed" => Ok(Self::Routed),
            other => Err(format!("unknown event state: {other}")),
        }
    }
}

/// An event flowing through a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub id: EventId,
    /// Workflow the event belongs to.
    pub workflow_id: WorkflowId,
    /// Node that produced the event.
    pub node_id: NodeId,
    /// Output channel the event was emitted on.
    pub channel: String,
    /// Type tag chosen by the producer.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payload.
    pub data: JsonValue,
    /// Routing state.
    pub state: EventState,
    /// The trigger event this event descends from.
    pub root_event_id: EventId,
    /// Execution that produced the event; absent for trigger events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Creates a pending trigger event. A trigger event is its own root.
    #[must_use]
    pub fn root(
        workflow_id: WorkflowId,
        node_id: NodeId,
        channel: impl Into<String>,
        event_type: impl Into<String>,
        data: JsonValue,
    ) -> Self {
        let id = EventId::new();
        Self {
            id,
            workflow_id,
            node_id,
            channel: channel.into(),
            event_type: event_type.into(),
            data,
            state: EventState::Pending,
            root_event_id: id,
            execution_id: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a pending event emitted by an execution.
    ///
    /// The event originates from the executing node and inherits the root
    /// of the event that started the execution.
    #[must_use]
    pub fn emitted(
        execution: &Execution,
        channel: impl Into<String>,
        event_type: impl Into<String>,
        data: JsonValue,
    ) -> Self {
        Self {
            id: EventId::new(),
            workflow_id: execution.workflow_id,
            node_id: execution.node_id,
            channel: channel.into(),
            event_type: event_type.into(),
            data,
            state: EventState::Pending,
            root_event_id: execution.root_event_id,
            execution_id: Some(execution.id),
            created_at: Utc::now(),
        }
    }

    /// Returns true if the event still needs routing.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == EventState::Pending
    }
}

/// Collapses the payloads emitted on one channel into event data.
///
/// A single payload becomes the data itself; anything else becomes an array.
#[must_use]
pub fn event_data(payloads: &[JsonValue]) -> JsonValue {
    match payloads {
        [single] => single.clone(),
        many => JsonValue::Array(many.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_item::QueueItem;
    use serde_json::json;

    #[test]
    fn root_event_is_its_own_root() {
        let event = Event::root(
            WorkflowId::new(),
            NodeId::new(),
            "default",
            "push",
            json!({"ref": "main"}),
        );
        assert_eq!(event.root_event_id, event.id);
        assert!(event.is_pending());
        assert!(event.execution_id.is_none());
    }

    #[test]
    fn emitted_event_inherits_root() {
        let trigger = Event::root(WorkflowId::new(), NodeId::new(), "default", "push", json!(1));
        let item = QueueItem::for_event(&trigger, NodeId::new());
        let execution = Execution::new(&item, trigger.data.clone());

        let event = Event::emitted(&execution, "passed", "ci.passed", json!({"ok": true}));
        assert_eq!(event.root_event_id, trigger.id);
        assert_eq!(event.node_id, item.node_id);
        assert_eq!(event.execution_id, Some(execution.id));
    }

    #[test]
    fn single_payload_is_unwrapped() {
        assert_eq!(event_data(&[json!({"a": 1})]), json!({"a": 1}));
        assert_eq!(event_data(&[json!(1), json!(2)]), json!([1, 2]));
    }

    #[test]
    fn event_json_uses_type_key() {
        let event = Event::root(WorkflowId::new(), NodeId::new(), "default", "push", json!(null));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "push");
        assert_eq!(value["state"], "pending");
    }

    #[test]
    fn state_parses_from_stored_form() {
        assert_eq!("routed".parse::<EventState>().unwrap(), EventState::Routed);
        assert!("done".parse::<EventState>().is_err());
    }
}
