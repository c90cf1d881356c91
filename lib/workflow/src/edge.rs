//! Edge types for workflow graphs.
//!
//! An edge carries events emitted on one output channel of its source node
//! to its target node. An optional filter narrows which events pass.

use crate::predicate::Filter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Channel used when a component does not name one.
pub const DEFAULT_CHANNEL: &str = "default";

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

/// An edge in a workflow graph.
///
/// Source and target live in the graph structure; the edge weight only holds
/// what decides whether an event travels along it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Output channel of the source node this edge listens on.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Optional filter on the event data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl Edge {
    /// Creates an unfiltered edge on the given channel.
    #[must_use]
    pub fn on_channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            filter: None,
        }
    }

    /// Adds a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Returns true if an event on `channel` carrying `data` travels along
    /// this edge.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter cannot be evaluated.
    pub fn accepts(
        &self,
        channel: &str,
        data: &JsonValue,
    ) -> Result<bool, crate::error::PredicateError> {
        if self.channel != channel {
            return Ok(false);
        }
        match &self.filter {
            Some(filter) => filter.evaluate(data),
            None => Ok(true),
        }
    }
}

impl Default for Edge {
    fn default() -> Self {
        Self::on_channel(DEFAULT_CHANNEL)
    }
}
