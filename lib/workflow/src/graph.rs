//! Workflow graph implementation using petgraph.
//!
//! Workflows are directed graphs where:
//! - Nodes are components or triggers
//! - Edges carry events from one node's output channel to another node
//!
//! Cycles are allowed. Routing only ever looks one hop ahead, so a loop in
//! the graph is just an event that keeps producing events.
//!
//! The graph is stored as JSON in the database; after deserializing call
//! [`WorkflowGraph::rebuild_index_map`] before looking nodes up.

use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::Node;
use conveyor_core::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

/// A workflow graph using petgraph's directed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// The underlying directed graph.
    #[serde(with = "graph_serde")]
    graph: DiGraph<Node, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    #[serde(skip)]
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
        }
    }

    /// Adds a node to the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if a node with the same ID is already present.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        let node_id = node.id;
        if self.node_index_map.contains_key(&node_id) {
            return Err(GraphError::DuplicateNode { node_id });
        }
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        Ok(node_id)
    }

    /// Returns a reference to a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(&node_id)?;
        self.graph.node_weight(*index)
    }

    /// Adds an edge between two nodes.
    ///
    /// Edges are kept in insertion order, which is the order downstream
    /// nodes are resolved in.
    ///
    /// # Errors
    ///
    /// Returns an error if either node doesn't exist or the edge filter
    /// is invalid.
    pub fn add_edge(
        &mut self,
        source_id: NodeId,
        target_id: NodeId,
        edge: Edge,
    ) -> Result<(), GraphError> {
        let source_index = *self
            .node_index_map
            .get(&source_id)
            .ok_or(GraphError::NodeNotFound { node_id: source_id })?;

        let target_index = *self
            .node_index_map
            .get(&target_id)
            .ok_or(GraphError::NodeNotFound { node_id: target_id })?;

        if let Some(filter) = &edge.filter {
            filter
                .validate()
                .map_err(|error| GraphError::InvalidFilter {
                    source_node: source_id,
                    target_node: target_id,
                    error,
                })?;
        }

        self.graph.add_edge(source_index, target_index, edge);
        Ok(())
    }

    /// Returns all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns the trigger nodes of the graph.
    pub fn triggers(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|node| node.is_trigger())
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the outgoing edges of a node in declaration order.
    pub fn successors(&self, node_id: NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(&node_id) else {
            return Vec::new();
        };

        // petgraph walks adjacency lists newest-first.
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .collect();
        edges.sort_by_key(|edge| edge.id().index());

        edges
            .into_iter()
            .filter_map(|edge| {
                let target = self.graph.node_weight(edge.target())?;
                Some((target, edge.weight()))
            })
            .collect()
    }

    /// Resolves the nodes an event travels to.
    ///
    /// Selects the targets of every edge leaving `node_id` on `channel`
    /// whose filter passes on `data`. The result follows edge declaration
    /// order and holds each node once. An empty result is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin node is unknown or a filter on a
    /// candidate edge cannot be evaluated.
    pub fn downstream(
        &self,
        node_id: NodeId,
        channel: &str,
        data: &JsonValue,
    ) -> Result<Vec<NodeId>, GraphError> {
        if !self.node_index_map.contains_key(&node_id) {
            return Err(GraphError::NodeNotFound { node_id });
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for (target, edge) in self.successors(node_id) {
            let accepted =
                edge.accepts(channel, data)
                    .map_err(|error| GraphError::InvalidFilter {
                        source_node: node_id,
                        target_node: target.id,
                        error,
                    })?;
            if accepted && seen.insert(target.id) {
                targets.push(target.id);
            }
        }
        Ok(targets)
    }

    /// Validates the workflow graph.
    ///
    /// Checks that every edge filter can be evaluated.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid edge.
    pub fn validate(&self) -> Result<(), GraphError> {
        for edge in self.graph.edge_references() {
            let Some(filter) = &edge.weight().filter else {
                continue;
            };
            let (Some(source), Some(target)) = (
                self.graph.node_weight(edge.source()),
                self.graph.node_weight(edge.target()),
            ) else {
                continue;
            };
            filter
                .validate()
                .map_err(|error| GraphError::InvalidFilter {
                    source_node: source.id,
                    target_node: target.id,
                    error,
                })?;
        }
        Ok(())
    }

    /// Rebuilds the node index map after deserialization.
    pub fn rebuild_index_map(&mut self) {
        self.node_index_map.clear();
        for index in self.graph.node_indices() {
            if let Some(node) = self.graph.node_weight(index) {
                self.node_index_map.insert(node.id, index);
            }
        }
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Custom serde for petgraph DiGraph.
///
/// Edges are written as `{source, target, channel, filter?}` objects.
mod graph_serde {
    use super::*;
    use crate::predicate::Filter;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeStruct;

    #[derive(Serialize, Deserialize)]
    struct EdgeRecord {
        source: NodeId,
        target: NodeId,
        #[serde(flatten)]
        edge: EdgeFields,
    }

    #[derive(Serialize, Deserialize)]
    struct EdgeFields {
        #[serde(default = "default_channel")]
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Filter>,
    }

    fn default_channel() -> String {
        crate::edge::DEFAULT_CHANNEL.to_string()
    }

    pub fn serialize<S>(graph: &DiGraph<Node, Edge>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let nodes: Vec<_> = graph.node_weights().collect();
        let edges: Vec<_> = graph
            .edge_references()
            .filter_map(|e| {
                let source = graph.node_weight(e.source())?.id;
                let target = graph.node_weight(e.target())?.id;
                Some(EdgeRecord {
                    source,
                    target,
                    edge: EdgeFields {
                        channel: e.weight().channel.clone(),
                        filter: e.weight().filter.clone(),
                    },
                })
            })
            .collect();

        let mut state = serializer.serialize_struct("Graph", 2)?;
        state.serialize_field("nodes", &nodes)?;
        state.serialize_field("edges", &edges)?;
        state.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DiGraph<Node, Edge>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct GraphVisitor;

        impl<'de> Visitor<'de> for GraphVisitor {
            type Value = DiGraph<Node, Edge>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a workflow graph with nodes and edges")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut nodes: Option<Vec<Node>> = None;
                let mut edges: Option<Vec<EdgeRecord>> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "nodes" => nodes = Some(map.next_value()?),
                        "edges" => edges = Some(map.next_value()?),
                        _ => {
                            let _ = map.next_value::<serde::de::IgnoredAny>()?;
                        }
                    }
                }

                let nodes = nodes.unwrap_or_default();
                let edges = edges.unwrap_or_default();

                let mut graph = DiGraph::new();
                let mut id_to_index = HashMap::new();

                for node in nodes {
                    let id = node.id;
                    if id_to_index.contains_key(&id) {
                        return Err(serde::de::Error::custom(format!("duplicate node: {id}")));
                    }
                    let index = graph.add_node(node);
                    id_to_index.insert(id, index);
                }

                for record in edges {
                    let (Some(&source_idx), Some(&target_idx)) = (
                        id_to_index.get(&record.source),
                        id_to_index.get(&record.target),
                    ) else {
                        return Err(serde::de::Error::custom(format!(
                            "edge {} -> {} references an unknown node",
                            record.source, record.target
                        )));
                    };
                    graph.add_edge(
                        source_idx,
                        target_idx,
                        Edge {
                            channel: record.edge.channel,
                            filter: record.edge.filter,
                        },
                    );
                }

                Ok(graph)
            }
        }

        deserializer.deserialize_struct("Graph", &["nodes", "edges"], GraphVisitor)
    }
}
