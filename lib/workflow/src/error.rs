//! Error types for the workflow crate.
//!
//! - `PredicateError`: A filter rule that cannot be evaluated
//! - `GraphError`: Graph construction and resolution failures
//! - `WorkflowError`: Workflow-level failures (wraps lower errors via context)

use conveyor_core::{NodeId, WorkflowId};
use std::fmt;

/// Errors from predicate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    /// A `matches` predicate carries a pattern that does not compile.
    InvalidPattern { pattern: String, reason: String },
}

impl fmt::Display for PredicateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "invalid pattern '{pattern}': {reason}")
            }
        }
    }
}

impl std::error::Error for PredicateError {}

/// Errors from graph operations.
///
/// These errors contain only information available at the graph layer.
/// Workflow-level context (like workflow_id) should be added by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// A node ID appears more than once.
    DuplicateNode { node_id: NodeId },
    /// An edge filter on the given edge cannot be evaluated.
    InvalidFilter {
        source_node: NodeId,
        target_node: NodeId,
        error: PredicateError,
    },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => {
                write!(f, "node not found: {node_id}")
            }
            Self::DuplicateNode { node_id } => {
                write!(f, "duplicate node: {node_id}")
            }
            Self::InvalidFilter {
                source_node,
                target_node,
                error,
            } => {
                write!(
                    f,
                    "invalid filter on edge {source_node} -> {target_node}: {error}"
                )
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// High-level workflow errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Workflow not found.
    NotFound { workflow_id: WorkflowId },
    /// The stored graph could not be decoded.
    InvalidGraph {
        workflow_id: WorkflowId,
        details: String,
    },
    /// Error in graph operation.
    Graph {
        workflow_id: WorkflowId,
        error: GraphError,
    },
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::InvalidGraph {
                workflow_id,
                details,
            } => {
                write!(f, "invalid graph for workflow {workflow_id}: {details}")
            }
            Self::Graph { workflow_id, error } => {
                write!(f, "graph error in workflow {workflow_id}: {error}")
            }
        }
    }
}

impl std::error::Error for WorkflowError {}
