//! Core domain types and utilities for conveyor.
//!
//! This crate provides the strongly-typed identifiers and the error handling
//! foundation shared by the workflow model, the execution engine and the
//! runner binary.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    EventId, ExecutionId, NodeId, OrganizationId, ParseIdError, QueueItemId, WorkflowId,
};
