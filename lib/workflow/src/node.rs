//! Workflow nodes.
//!
//! A node places a named component or trigger in a workflow together with
//! the configuration it runs with. The engine looks the implementation up by
//! `reference` in its registry; the configuration stays raw JSON here and is
//! validated against the implementation's schema when the node runs.

use conveyor_core::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Whether a node is an entry point or a processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Runs when a queue item is delivered to it.
    Component,
    /// Produces root events from outside the graph.
    Trigger,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Component => write!(f, "component"),
            Self::Trigger => write!(f, "trigger"),
        }
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the workflow.
    pub id: NodeId,
    /// Human-readable name.
    pub name: String,
    /// Component or trigger.
    pub kind: NodeKind,
    /// Registered name of the component or trigger implementation.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Implementation-specific configuration.
    #[serde(default = "empty_object")]
    pub configuration: JsonValue,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

impl Node {
    /// Creates a component node with empty configuration.
    #[must_use]
    pub fn component(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Component, reference)
    }

    /// Creates a trigger node with empty configuration.
    #[must_use]
    pub fn trigger(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Trigger, reference)
    }

    fn new(name: impl Into<String>, kind: NodeKind, reference: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            kind,
            reference: reference.into(),
            configuration: empty_object(),
        }
    }

    /// Sets the node's ID.
    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Sets the node's configuration.
    #[must_use]
    pub fn with_configuration(mut self, configuration: JsonValue) -> Self {
        self.configuration = configuration;
        self
    }

    /// Returns true if this node is a trigger.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.kind == NodeKind::Trigger
    }
}
