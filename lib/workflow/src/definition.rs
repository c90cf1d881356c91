//! Workflow definition types.
//!
//! A workflow is a named graph owned by an organization. The engine only
//! ever reads workflows; editing them is someone else's business.

use crate::error::WorkflowError;
use crate::graph::WorkflowGraph;
use crate::node::Node;
use chrono::{DateTime, Utc};
use conveyor_core::{NodeId, OrganizationId, WorkflowId};
use serde::{Deserialize, Serialize};

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// Human-readable name.
    pub name: String,
    /// The workflow graph (nodes and edges).
    pub graph: WorkflowGraph,
    /// When this workflow was created.
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Creates a new workflow with an empty graph.
    #[must_use]
    pub fn new(organization_id: OrganizationId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            organization_id,
            name: name.into(),
            graph: WorkflowGraph::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Decodes a workflow graph from its stored JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not a valid graph or an edge filter
    /// is invalid.
    pub fn decode_graph(
        workflow_id: WorkflowId,
        value: serde_json::Value,
    ) -> Result<WorkflowGraph, WorkflowError> {
        let mut graph: WorkflowGraph =
            serde_json::from_value(value).map_err(|e| WorkflowError::InvalidGraph {
                workflow_id,
                details: e.to_string(),
            })?;
        graph.rebuild_index_map();
        graph
            .validate()
            .map_err(|error| WorkflowError::Graph { workflow_id, error })?;
        Ok(graph)
    }

    /// Returns the node with the given ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not part of this workflow.
    pub fn node(&self, node_id: NodeId) -> Result<&Node, WorkflowError> {
        self.graph
            .get_node(node_id)
            .ok_or_else(|| WorkflowError::Graph {
                workflow_id: self.id,
                error: crate::error::GraphError::NodeNotFound { node_id },
            })
    }

    /// Marks the workflow as updated (bumps updated_at timestamp).
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use serde_json::json;

    #[test]
    fn workflow_creation() {
        let org = OrganizationId::new();
        let workflow = Workflow::new(org, "Deploy");
        assert_eq!(workflow.name, "Deploy");
        assert_eq!(workflow.organization_id, org);
        assert_eq!(workflow.graph.node_count(), 0);
    }

    #[test]
    fn node_lookup() {
        let mut workflow = Workflow::new(OrganizationId::new(), "Lookup");
        let id = workflow
            .graph
            .add_node(Node::component("Pass", "noop"))
            .unwrap();

        assert_eq!(workflow.node(id).unwrap().reference, "noop");
        assert!(matches!(
            workflow.node(NodeId::new()),
            Err(WorkflowError::Graph { .. })
        ));
    }

    #[test]
    fn decode_graph_rebuilds_index() {
        let mut workflow = Workflow::new(OrganizationId::new(), "Stored");
        let trigger = workflow
            .graph
            .add_node(Node::trigger("Start", "manual"))
            .unwrap();
        let step = workflow
            .graph
            .add_node(Node::component("Step", "noop"))
            .unwrap();
        workflow
            .graph
            .add_edge(trigger, step, Edge::default())
            .unwrap();

        let value = serde_json::to_value(&workflow.graph).unwrap();
        let graph = Workflow::decode_graph(workflow.id, value).unwrap();
        assert_eq!(
            graph.downstream(trigger, "default", &json!({})).unwrap(),
            vec![step]
        );
    }

    #[test]
    fn decode_graph_rejects_garbage() {
        let result = Workflow::decode_graph(WorkflowId::new(), json!({"nodes": 5}));
        assert!(matches!(result, Err(WorkflowError::InvalidGraph { .. })));
    }

    #[test]
    fn touch_bumps_updated_at() {
        let mut workflow = Workflow::new(OrganizationId::new(), "Touch");
        let before = workflow.updated_at;
        workflow.touch();
        assert!(workflow.updated_at >= before);
    }
}
