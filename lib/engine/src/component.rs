//! Component and trigger contracts.
//!
//! Components run when a queue item reaches their node; triggers produce
//! root events from outside the graph. Both only ever produce output through
//! [`Emitter::emit`], which checks the channel against the ones the
//! implementation declared for its configuration.
//!
//! Every hook has a default so implementations only write what they need.

use crate::configuration::{ConfigSchema, Configuration};
use crate::error::ComponentError;
use crate::execution::Execution;
use async_trait::async_trait;
use conveyor_core::{EventId, ExecutionId, NodeId, WorkflowId};
use conveyor_workflow::DEFAULT_CHANNEL;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Payloads emitted on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub channel: String,
    pub event_type: String,
    pub payloads: Vec<JsonValue>,
}

/// Collects emissions for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Emitter {
    channels: Vec<String>,
    emissions: Vec<Emission>,
}

impl Emitter {
    /// Creates an emitter accepting the given channels.
    #[must_use]
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            emissions: Vec::new(),
        }
    }

    /// Records payloads on a channel.
    ///
    /// An empty payload list is accepted and produces nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel was not declared or was already
    /// emitted on.
    pub fn emit(
        &mut self,
        channel: &str,
        event_type: &str,
        payloads: Vec<JsonValue>,
    ) -> Result<(), ComponentError> {
        if !self.channels.iter().any(|c| c == channel) {
            return Err(ComponentError::UnknownChannel {
                channel: channel.to_string(),
            });
        }
        if self.emissions.iter().any(|e| e.channel == channel) {
            return Err(ComponentError::ChannelAlreadyEmitted {
                channel: channel.to_string(),
            });
        }
        if payloads.is_empty() {
            return Ok(());
        }
        self.emissions.push(Emission {
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            payloads,
        });
        Ok(())
    }

    /// Returns true if anything was emitted.
    #[must_use]
    pub fn has_emitted(&self) -> bool {
        !self.emissions.is_empty()
    }

    /// Returns the emissions in the order they were made.
    #[must_use]
    pub fn emissions(&self) -> &[Emission] {
        &self.emissions
    }

    /// Consumes the emitter, returning its emissions.
    #[must_use]
    pub fn into_emissions(self) -> Vec<Emission> {
        self.emissions
    }
}

/// What to do with a delivered queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processing {
    /// Call `execute` now.
    Execute,
    /// Park the execution in `waiting` until an action or webhook resumes it.
    Await,
}

/// An inbound HTTP request handed to a webhook hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRequest {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl WebhookRequest {
    /// Creates a request with the given body and no headers.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header. Names are case-insensitive.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Returns a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the raw body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON.
    pub fn json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Context for one invocation of component logic.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    workflow_id: WorkflowId,
    node_id: NodeId,
    root_event_id: EventId,
    input: JsonValue,
    configuration: Configuration,
    emitter: Emitter,
    suspended: bool,
}

impl ExecutionContext {
    /// Creates a context for an execution.
    #[must_use]
    pub fn new(execution: &Execution, configuration: Configuration, channels: Vec<String>) -> Self {
        Self {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            node_id: execution.node_id,
            root_event_id: execution.root_event_id,
            input: execution.input_data.clone(),
            configuration,
            emitter: Emitter::new(channels),
            suspended: false,
        }
    }

    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn root_event_id(&self) -> EventId {
        self.root_event_id
    }

    /// Data of the event that started the execution.
    #[must_use]
    pub fn input(&self) -> &JsonValue {
        &self.input
    }

    /// Validated node configuration.
    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Emits payloads on a declared channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is undeclared or already used, or if
    /// the invocation already suspended.
    pub fn emit(
        &mut self,
        channel: &str,
        event_type: &str,
        payloads: Vec<JsonValue>,
    ) -> Result<(), ComponentError> {
        if self.suspended {
            return Err(ComponentError::EmitWhileSuspended);
        }
        self.emitter.emit(channel, event_type, payloads)
    }

    /// Leaves the execution in `waiting` once the invocation returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the invocation already emitted.
    pub fn suspend(&mut self) -> Result<(), ComponentError> {
        if self.emitter.has_emitted() {
            return Err(ComponentError::EmitWhileSuspended);
        }
        self.suspended = true;
        Ok(())
    }

    /// Returns true if the invocation suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Returns the emissions made so far.
    #[must_use]
    pub fn emissions(&self) -> &[Emission] {
        self.emitter.emissions()
    }
}

/// Component logic run against delivered events.
#[async_trait]
pub trait Component: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Accepted configuration.
    fn configuration(&self) -> ConfigSchema {
        ConfigSchema::new()
    }

    /// Channels the component may emit on with this configuration.
    fn output_channels(&self, _config: &Configuration) -> Vec<String> {
        vec![DEFAULT_CHANNEL.to_string()]
    }

    /// Checks configuration beyond what the schema expresses.
    fn setup(&self, _config: &Configuration) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Chooses between running now and waiting for external input.
    async fn process_queue_item(
        &self,
        _ctx: &ExecutionContext,
    ) -> Result<Processing, ComponentError> {
        Ok(Processing::Execute)
    }

    /// Runs the component.
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError>;

    /// Cleans up after a cancel request.
    async fn cancel(&self, _ctx: &ExecutionContext) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Resumes a waiting execution with a user action.
    async fn handle_action(
        &self,
        _ctx: &mut ExecutionContext,
        action: &str,
        _parameters: &JsonValue,
    ) -> Result<(), ComponentError> {
        Err(ComponentError::UnsupportedAction {
            action: action.to_string(),
        })
    }

    /// Resumes a waiting execution with a callback. Returns the HTTP status.
    async fn handle_webhook(
        &self,
        _ctx: &mut ExecutionContext,
        _request: &WebhookRequest,
    ) -> Result<u16, ComponentError> {
        Ok(404)
    }
}

/// A webhook a trigger asked to have provisioned.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRegistration {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    /// Provider-specific description of what to register.
    pub configuration: JsonValue,
}

/// Context for trigger setup and cleanup.
#[derive(Debug, Clone)]
pub struct SetupContext {
    workflow_id: WorkflowId,
    node_id: NodeId,
    configuration: Configuration,
    metadata: Option<JsonValue>,
    metadata_changed: bool,
    webhooks: Vec<WebhookRegistration>,
}

impl SetupContext {
    /// Creates a context with the metadata recorded for the node.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        node_id: NodeId,
        configuration: Configuration,
        metadata: Option<JsonValue>,
    ) -> Self {
        Self {
            workflow_id,
            node_id,
            configuration,
            metadata,
            metadata_changed: false,
            webhooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Metadata recorded by an earlier setup, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&JsonValue> {
        self.metadata.as_ref()
    }

    /// Replaces the recorded metadata.
    pub fn set_metadata(&mut self, metadata: JsonValue) {
        self.metadata = Some(metadata);
        self.metadata_changed = true;
    }

    /// Asks for a webhook to be provisioned for this node.
    pub fn request_webhook(&mut self, configuration: JsonValue) {
        self.webhooks.push(WebhookRegistration {
            workflow_id: self.workflow_id,
            node_id: self.node_id,
            configuration,
        });
    }

    /// Returns the metadata if `set_metadata` was called.
    #[must_use]
    pub fn changed_metadata(&self) -> Option<&JsonValue> {
        self.metadata.as_ref().filter(|_| self.metadata_changed)
    }

    /// Returns the requested webhooks.
    #[must_use]
    pub fn webhooks(&self) -> &[WebhookRegistration] {
        &self.webhooks
    }
}

/// Context for a trigger's webhook handler.
#[derive(Debug, Clone)]
pub struct WebhookContext {
    workflow_id: WorkflowId,
    node_id: NodeId,
    configuration: Configuration,
    metadata: Option<JsonValue>,
    request: WebhookRequest,
    emitter: Emitter,
}

impl WebhookContext {
    /// Creates a context for one inbound request.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        node_id: NodeId,
        configuration: Configuration,
        metadata: Option<JsonValue>,
        request: WebhookRequest,
        channels: Vec<String>,
    ) -> Self {
        Self {
            workflow_id,
            node_id,
            configuration,
            metadata,
            request,
            emitter: Emitter::new(channels),
        }
    }

    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&JsonValue> {
        self.metadata.as_ref()
    }

    #[must_use]
    pub fn request(&self) -> &WebhookRequest {
        &self.request
    }

    /// Emits payloads on a declared channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is undeclared or already used.
    pub fn emit(
        &mut self,
        channel: &str,
        event_type: &str,
        payloads: Vec<JsonValue>,
    ) -> Result<(), ComponentError> {
        self.emitter.emit(channel, event_type, payloads)
    }

    /// Returns the emissions made so far.
    #[must_use]
    pub fn emissions(&self) -> &[Emission] {
        self.emitter.emissions()
    }
}

/// Trigger logic producing root events.
#[async_trait]
pub trait Trigger: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Accepted configuration.
    fn configuration(&self) -> ConfigSchema {
        ConfigSchema::new()
    }

    /// Channels the trigger may emit on with this configuration.
    fn output_channels(&self, _config: &Configuration) -> Vec<String> {
        vec![DEFAULT_CHANNEL.to_string()]
    }

    /// Provisions whatever the trigger needs to receive events.
    async fn setup(&self, _ctx: &mut SetupContext) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Handles an inbound request. Returns the HTTP status.
    async fn handle_webhook(&self, _ctx: &mut WebhookContext) -> Result<u16, ComponentError> {
        Ok(404)
    }

    /// Releases what `setup` provisioned.
    async fn cleanup(&self, _ctx: &mut SetupContext) -> Result<(), ComponentError> {
        Ok(())
    }
}
