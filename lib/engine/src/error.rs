//! Error types for the engine.
//!
//! - `StoreError` / `TransportError`: infrastructure failures, mostly transient
//! - `ComponentError`: failures inside component or trigger logic
//! - `EngineError`: everything the router, worker and executor surface
//!
//! `EngineError::is_transient` decides whether work is retried (nack, leave
//! pending) or settled (ack, record a failed execution).

use crate::execution::{ExecutionState, InvalidTransition};
use conveyor_core::{EventId, ExecutionId, NodeId, QueueItemId};
use conveyor_workflow::WorkflowError;
use std::fmt;

/// Errors from durable store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the write did not commit.
    Unavailable { message: String },
    /// A stored row could not be decoded.
    Decode { message: String },
}

impl StoreError {
    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "store unavailable: {message}"),
            Self::Decode { message } => write!(f, "failed to decode stored row: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the queue transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to connect or set up streams.
    ConnectionFailed { message: String },
    /// Failed to publish a queue item.
    PublishFailed { message: String },
    /// Failed to receive from the transport.
    ReceiveFailed { message: String },
    /// Failed to acknowledge a delivery.
    AckFailed { message: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "transport connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "publish failed: {message}"),
            Self::ReceiveFailed { message } => write!(f, "receive failed: {message}"),
            Self::AckFailed { message } => write!(f, "acknowledgement failed: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors raised by component or trigger logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    /// Configuration did not satisfy the component's schema.
    InvalidConfiguration { message: String },
    /// The component reported a failure. The message is kept verbatim.
    Failed { message: String },
    /// Emit on a channel the component did not declare.
    UnknownChannel { channel: String },
    /// A channel was emitted on twice in one invocation.
    ChannelAlreadyEmitted { channel: String },
    /// Emit and suspend were both requested in one invocation.
    EmitWhileSuspended,
    /// The component does not support the requested action.
    UnsupportedAction { action: String },
    /// Component code panicked.
    Panicked { message: String },
}

impl ComponentError {
    /// Creates a `Failed` error carrying an upstream message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates an `InvalidConfiguration` error.
    #[must_use]
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { message } => {
                write!(f, "invalid configuration: {message}")
            }
            Self::Failed { message } => write!(f, "{message}"),
            Self::UnknownChannel { channel } => {
                write!(f, "channel '{channel}' is not declared")
            }
            Self::ChannelAlreadyEmitted { channel } => {
                write!(f, "channel '{channel}' was already emitted")
            }
            Self::EmitWhileSuspended => {
                write!(f, "cannot emit and suspend in the same invocation")
            }
            Self::UnsupportedAction { action } => write!(f, "unsupported action: {action}"),
            Self::Panicked { message } => write!(f, "component panicked: {message}"),
        }
    }
}

impl std::error::Error for ComponentError {}

/// Errors from engine operations.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Durable store error.
    Store(StoreError),
    /// Transport error.
    Transport(TransportError),
    /// Workflow could not be resolved or its graph is invalid.
    Workflow(WorkflowError),
    /// Component or trigger error outside of an execution.
    Component(ComponentError),
    /// Event not found.
    EventNotFound { event_id: EventId },
    /// Queue item not found.
    QueueItemNotFound { queue_item_id: QueueItemId },
    /// Execution not found.
    ExecutionNotFound { execution_id: ExecutionId },
    /// No component registered under the name.
    UnknownComponent { name: String },
    /// No trigger registered under the name.
    UnknownTrigger { name: String },
    /// Node is not a trigger.
    NotATrigger { node_id: NodeId },
    /// The execution is not in a state that allows the operation.
    InvalidState {
        execution_id: ExecutionId,
        state: ExecutionState,
    },
    /// An execution state transition was rejected.
    Transition(InvalidTransition),
}

impl EngineError {
    /// Returns true if the failed work should be retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Workflow(e) => write!(f, "{e}"),
            Self::Component(e) => write!(f, "component error: {e}"),
            Self::EventNotFound { event_id } => write!(f, "event not found: {event_id}"),
            Self::QueueItemNotFound { queue_item_id } => {
                write!(f, "queue item not found: {queue_item_id}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::UnknownComponent { name } => write!(f, "unknown component: {name}"),
            Self::UnknownTrigger { name } => write!(f, "unknown trigger: {name}"),
            Self::NotATrigger { node_id } => write!(f, "node {node_id} is not a trigger"),
            Self::InvalidState {
                execution_id,
                state,
            } => write!(f, "execution {execution_id} is {state}"),
            Self::Transition(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<WorkflowError> for EngineError {
    fn from(e: WorkflowError) -> Self {
        Self::Workflow(e)
    }
}

impl From<ComponentError> for EngineError {
    fn from(e: ComponentError) -> Self {
        Self::Component(e)
    }
}

impl From<InvalidTransition> for EngineError {
    fn from(e: InvalidTransition) -> Self {
        Self::Transition(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::WorkflowId;

    #[test]
    fn failed_display_is_verbatim() {
        let err = ComponentError::failed("semaphore: 502 Bad Gateway");
        assert_eq!(err.to_string(), "semaphore: 502 Bad Gateway");
    }

    #[test]
    fn transient_classification() {
        let unavailable = EngineError::from(StoreError::Unavailable {
            message: "connection reset".to_string(),
        });
        assert!(unavailable.is_transient());

        let publish = EngineError::from(TransportError::PublishFailed {
            message: "timeout".to_string(),
        });
        assert!(publish.is_transient());

        let decode = EngineError::from(StoreError::Decode {
            message: "bad id".to_string(),
        });
        assert!(!decode.is_transient());

        let missing = EngineError::from(WorkflowError::NotFound {
            workflow_id: WorkflowId::new(),
        });
        assert!(!missing.is_transient());
    }

    #[test]
    fn invalid_state_display() {
        let execution_id = ExecutionId::new();
        let err = EngineError::InvalidState {
            execution_id,
            state: ExecutionState::Completed,
        };
        assert_eq!(err.to_string(), format!("execution {execution_id} is completed"));
    }
}
