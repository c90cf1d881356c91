//! Workflow model for conveyor.
//!
//! This crate holds the static side of a workflow:
//!
//! - **Graph Model**: Directed graphs using petgraph with component and trigger nodes
//! - **Edges**: Channel-scoped connections, optionally guarded by a filter
//! - **Predicates**: Equality, regex and set-membership rules used by filters
//! - **Resolution**: Computing the downstream nodes for an emitted event

pub mod definition;
pub mod edge;
pub mod error;
pub mod graph;
pub mod node;
pub mod predicate;

pub use conveyor_core::NodeId;
pub use definition::Workflow;
pub use edge::{DEFAULT_CHANNEL, Edge};
pub use error::{GraphError, PredicateError, WorkflowError};
pub use graph::WorkflowGraph;
pub use node::{Node, NodeKind};
pub use predicate::{Filter, Pattern, Predicate, matches_any};
