//! Execution state machine.
//!
//! ```text
//! pending ──> running ──> completed
//!    │           │ ├────> failed
//!    │           │ └────> waiting ──> running
//!    │           └──────> canceled     ├──> canceled
//!    └──> failed                       └──> failed
//! ```
//!
//! `completed`, `failed` and `canceled` are terminal. Every method that moves
//! an execution checks the transition first, and stores only persist a
//! transition if the row is still in the state the caller started from.

use crate::queue_item::QueueItem;
use chrono::{DateTime, Utc};
use conveyor_core::{EventId, ExecutionId, NodeId, QueueItemId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Payloads an execution emitted, keyed by channel.
pub type ExecutionOutput = BTreeMap<String, Vec<JsonValue>>;

/// The state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created, not yet claimed by an executor.
    Pending,
    /// Component logic is running.
    Running,
    /// Suspended until an action, webhook or the reaper resumes it.
    Waiting,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Canceled on request.
    Canceled,
}

impl ExecutionState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Returns true if the machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use ExecutionState::{Canceled, Completed, Failed, Pending, Running, Waiting};
        matches!(
            (self, next),
            (Pending, Running | Failed)
                | (Running, Completed | Failed | Waiting | Canceled)
                | (Waiting, Running | Canceled | Failed)
        )
    }

    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown execution state: {other}")),
        }
    }
}

/// A rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub execution_id: ExecutionId,
    pub from: ExecutionState,
    pub to: ExecutionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execution {} cannot move from {} to {}",
            self.execution_id, self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// A tracked run of a component against one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier.
    pub id: ExecutionId,
    /// Workflow the execution belongs to.
    pub workflow_id: WorkflowId,
    /// Node being executed.
    pub node_id: NodeId,
    /// Queue item that caused the execution. Unique per execution.
    pub queue_item_id: QueueItemId,
    /// Event delivered by the queue item.
    pub event_id: EventId,
    /// Root of the delivered event.
    pub root_event_id: EventId,
    /// Current state.
    pub state: ExecutionState,
    /// Data of the delivered event.
    pub input_data: JsonValue,
    /// Emitted payloads, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<ExecutionOutput>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Creates a pending execution for a queue item.
    #[must_use]
    pub fn new(item: &QueueItem, input_data: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            workflow_id: item.workflow_id,
            node_id: item.node_id,
            queue_item_id: item.id,
            event_id: item.event_id,
            root_event_id: item.root_event_id,
            state: ExecutionState::Pending,
            input_data,
            output_data: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition_to(&mut self, next: ExecutionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                execution_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves to `running`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the execution is pending or waiting.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionState::Running)
    }

    /// Moves to `completed` with the emitted payloads.
    ///
    /// # Errors
    ///
    /// Returns an error unless the execution is running.
    pub fn complete(&mut self, output: ExecutionOutput) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionState::Completed)?;
        self.output_data = Some(output);
        Ok(())
    }

    /// Moves to `failed` with a reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is already terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionState::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Moves to `waiting`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the execution is running.
    pub fn suspend(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionState::Waiting)
    }

    /// Moves to `canceled`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the execution is running or waiting.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionState::Canceled)
    }
}
