//! Trigger runtime.
//!
//! Runs trigger setup and cleanup against the provisioning metadata recorded
//! for each trigger node, and turns inbound webhooks and manual fires into
//! pending root events for the router. Trigger hooks run on their own task
//! like component hooks; a panic comes back as `ComponentError::Panicked`.

use crate::component::{SetupContext, Trigger, WebhookContext, WebhookRegistration, WebhookRequest};
use crate::configuration::Configuration;
use crate::error::{ComponentError, EngineError};
use crate::event::{Event, event_data};
use crate::executor::{invoke, join_failure};
use crate::registry::Registry;
use crate::store::Store;
use async_trait::async_trait;
use conveyor_core::{NodeId, WorkflowId};
use conveyor_workflow::{DEFAULT_CHANNEL, Node, WorkflowError};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Event type of manually fired events.
pub const MANUAL_EVENT_TYPE: &str = "manual";

/// Creates and removes webhooks in external systems.
#[async_trait]
pub trait WebhookProvisioner: Send + Sync {
    /// Provisions a webhook a trigger asked for during setup.
    async fn provision(&self, registration: &WebhookRegistration) -> Result<(), ComponentError>;

    /// Removes whatever was provisioned for a trigger node.
    async fn deprovision(&self, workflow_id: WorkflowId, node_id: NodeId)
    -> Result<(), ComponentError>;
}

/// Provisioner that only logs requests, for deployments where webhooks are
/// registered out of band.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProvisioner;

#[async_trait]
impl WebhookProvisioner for LoggingProvisioner {
    async fn provision(&self, registration: &WebhookRegistration) -> Result<(), ComponentError> {
        info!(
            workflow_id = %registration.workflow_id,
            node_id = %registration.node_id,
            configuration = %registration.configuration,
            "webhook requested"
        );
        Ok(())
    }

    async fn deprovision(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<(), ComponentError> {
        info!(%workflow_id, %node_id, "webhook removal requested");
        Ok(())
    }
}

struct ResolvedTrigger {
    node: Node,
    trigger: Arc<dyn Trigger>,
    configuration: Configuration,
}

/// Runs trigger hooks and records the events they produce.
pub struct TriggerRuntime<S, P> {
    store: Arc<S>,
    registry: Arc<Registry>,
    provisioner: Arc<P>,
}

impl<S: Store, P: WebhookProvisioner> TriggerRuntime<S, P> {
    /// Creates a trigger runtime.
    pub fn new(store: Arc<S>, registry: Arc<Registry>, provisioner: Arc<P>) -> Self {
        Self {
            store,
            registry,
            provisioner,
        }
    }

    async fn resolve(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<ResolvedTrigger, EngineError> {
        let workflow = self
            .store
            .find_workflow(workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound { workflow_id })?;
        let node = workflow.node(node_id)?.clone();
        if !node.is_trigger() {
            return Err(EngineError::NotATrigger { node_id });
        }
        let trigger =
            self.registry
                .trigger(&node.reference)
                .ok_or_else(|| EngineError::UnknownTrigger {
                    name: node.reference.clone(),
                })?;
        let hooks = Arc::clone(&trigger);
        let raw = node.configuration.clone();
        let configuration = tokio::spawn(async move { hooks.configuration().validate(&raw) })
            .await
            .map_err(join_failure)??;
        Ok(ResolvedTrigger {
            node,
            trigger,
            configuration,
        })
    }

    /// Runs a trigger's setup with its recorded metadata.
    ///
    /// Webhooks the trigger requests are handed to the provisioner before
    /// any changed metadata is saved, so a failed provision is retried on the
    /// next setup.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be resolved, setup fails or
    /// provisioning fails.
    #[instrument(skip(self))]
    pub async fn setup_trigger(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<(), EngineError> {
        let resolved = self.resolve(workflow_id, node_id).await?;
        let metadata = self.store.find_node_metadata(workflow_id, node_id).await?;
        let ctx = SetupContext::new(workflow_id, node_id, resolved.configuration, metadata);
        let trigger = Arc::clone(&resolved.trigger);
        let (ctx, ()) = invoke(async move {
            let mut ctx = ctx;
            let result = trigger.setup(&mut ctx).await;
            (ctx, result)
        })
        .await?;

        for registration in ctx.webhooks() {
            self.provisioner.provision(registration).await?;
        }
        match ctx.changed_metadata() {
            Some(metadata) => {
                self.store
                    .save_node_metadata(workflow_id, node_id, metadata)
                    .await?;
                info!(trigger = %resolved.node.reference, "trigger provisioned");
            }
            None => debug!(trigger = %resolved.node.reference, "trigger already provisioned"),
        }
        Ok(())
    }

    /// Sets up every trigger node of a workflow. Returns how many were set up.
    ///
    /// # Errors
    ///
    /// Stops at the first trigger that fails.
    pub async fn setup_workflow(&self, workflow_id: WorkflowId) -> Result<usize, EngineError> {
        let workflow = self
            .store
            .find_workflow(workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound { workflow_id })?;
        let triggers: Vec<NodeId> = workflow.graph.triggers().map(|node| node.id).collect();
        for node_id in &triggers {
            self.setup_trigger(workflow_id, *node_id).await?;
        }
        Ok(triggers.len())
    }

    /// Runs a trigger's cleanup and removes its webhooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be resolved or cleanup fails.
    #[instrument(skip(self))]
    pub async fn cleanup_trigger(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<(), EngineError> {
        let resolved = self.resolve(workflow_id, node_id).await?;
        let metadata = self.store.find_node_metadata(workflow_id, node_id).await?;
        let ctx = SetupContext::new(workflow_id, node_id, resolved.configuration, metadata);
        let (ctx, ()) = invoke(async move {
            let mut ctx = ctx;
            let result = resolved.trigger.cleanup(&mut ctx).await;
            (ctx, result)
        })
        .await?;
        self.provisioner.deprovision(workflow_id, node_id).await?;
        if let Some(metadata) = ctx.changed_metadata() {
            self.store
                .save_node_metadata(workflow_id, node_id, metadata)
                .await?;
        }
        Ok(())
    }

    /// Passes an inbound request to a trigger and records what it emits as
    /// root events, all in one write. Returns the trigger's HTTP status.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be resolved, the trigger fails or
    /// an event cannot be stored.
    #[instrument(skip(self, request))]
    pub async fn handle_webhook(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
        request: WebhookRequest,
    ) -> Result<u16, EngineError> {
        let resolved = self.resolve(workflow_id, node_id).await?;
        let metadata = self.store.find_node_metadata(workflow_id, node_id).await?;
        let ResolvedTrigger {
            trigger,
            configuration,
            ..
        } = resolved;
        let (ctx, status) = invoke(async move {
            let channels = trigger.output_channels(&configuration);
            let mut ctx = WebhookContext::new(
                workflow_id,
                node_id,
                configuration,
                metadata,
                request,
                channels,
            );
            let result = trigger.handle_webhook(&mut ctx).await;
            (ctx, result)
        })
        .await?;

        let events: Vec<Event> = ctx
            .emissions()
            .iter()
            .map(|emission| {
                Event::root(
                    workflow_id,
                    node_id,
                    emission.channel.clone(),
                    emission.event_type.clone(),
                    event_data(&emission.payloads),
                )
            })
            .collect();
        self.store.create_events(&events).await?;
        for event in &events {
            info!(event_id = %event.id, channel = %event.channel, "trigger event recorded");
        }
        Ok(status)
    }

    /// Fires a trigger by hand, recording one root event on the default
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not a registered trigger or the event
    /// cannot be stored.
    #[instrument(skip(self, payload))]
    pub async fn fire(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
        payload: JsonValue,
    ) -> Result<Event, EngineError> {
        self.resolve(workflow_id, node_id).await?;
        let event = Event::root(
            workflow_id,
            node_id,
            DEFAULT_CHANNEL,
            MANUAL_EVENT_TYPE,
            payload,
        );
        self.store.create_event(&event).await?;
        info!(event_id = %event.id, "trigger fired");
        Ok(event)
    }
}
