//! Execution engine for conveyor.
//!
//! This crate drives events through workflow graphs:
//!
//! - **Routing**: Claiming pending events and creating queue items atomically
//! - **Dispatch**: Publishing queue items and consuming them with ack/nack
//! - **Execution**: The per-node state machine and component invocation
//! - **Maintenance**: Republishing stranded queue items and reaping stuck executions
//! - **Triggers**: Provisioning, inbound webhooks and manual fires
//! - **Built-ins**: `noop`, `if`, `filter`, `approval`, `webhook` and `manual`

pub mod builtin;
pub mod component;
pub mod configuration;
pub mod envelope;
pub mod error;
pub mod event;
pub mod execution;
pub mod executor;
pub mod memory;
pub mod nats;
pub mod queue_item;
pub mod reaper;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod store;
pub mod transport;
pub mod trigger;
pub mod worker;

pub use component::{
    Component, Emission, ExecutionContext, Processing, SetupContext, Trigger, WebhookContext,
    WebhookRegistration, WebhookRequest,
};
pub use configuration::{ConfigField, ConfigSchema, Configuration, FieldKind};
pub use envelope::{Envelope, EnvelopeError};
pub use error::{ComponentError, EngineError, StoreError, TransportError};
pub use event::{Event, EventState};
pub use execution::{Execution, ExecutionOutput, ExecutionState, InvalidTransition};
pub use executor::NodeExecutor;
pub use memory::{MemoryStore, MemoryTransport};
pub use nats::{NatsConfig, NatsTransport};
pub use queue_item::QueueItem;
pub use reaper::{Reaper, ReaperConfig};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use registry::Registry;
pub use router::{Router, RouterConfig, RoutingSummary};
pub use store::{
    CreateOutcome, EventStore, ExecutionStore, NodeMetadataStore, QueueItemStore, Store,
    WorkflowStore,
};
pub use transport::{Acknowledger, Deliveries, Delivery, Transport};
pub use trigger::{LoggingProvisioner, TriggerRuntime, WebhookProvisioner};
pub use worker::{Handled, Worker};
