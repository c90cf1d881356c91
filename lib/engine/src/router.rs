//! Event router.
//!
//! Polls for pending events and turns each one into queue items for its
//! downstream nodes. Queue item creation and the `pending -> routed` flip
//! commit together; publishing happens afterwards, so a crash between the
//! two leaves unpublished items for the reconciler rather than lost work.

use crate::error::EngineError;
use crate::event::Event;
use crate::queue_item::QueueItem;
use crate::store::Store;
use crate::transport::Transport;
use chrono::Utc;
use conveyor_workflow::WorkflowError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Router tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Maximum events claimed per poll.
    pub batch_size: usize,
    /// How long a claim keeps other routers away from an event.
    pub claim_lease: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            claim_lease: Duration::from_secs(30),
        }
    }
}

/// Counts from one routing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingSummary {
    /// Events claimed.
    pub claimed: usize,
    /// Events marked routed.
    pub routed: usize,
    /// Events left pending after an error.
    pub failed: usize,
    /// Queue items handed to the transport.
    pub published: usize,
}

/// Routes pending events into queue items.
pub struct Router<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    config: RouterConfig,
}

impl<S: Store, T: Transport> Router<S, T> {
    /// Creates a router.
    pub fn new(store: Arc<S>, transport: Arc<T>, config: RouterConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Claims a batch of pending events and routes each of them.
    ///
    /// A failure on one event is logged and leaves that event pending; the
    /// rest of the batch is still routed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the claim itself fails.
    pub async fn route_once(&self) -> Result<RoutingSummary, EngineError> {
        let events = self
            .store
            .claim_pending_events(self.config.batch_size, self.config.claim_lease)
            .await?;
        let mut summary = RoutingSummary {
            claimed: events.len(),
            ..RoutingSummary::default()
        };

        for event in events {
            match self.route_event(&event).await {
                Ok(published) => {
                    summary.routed += 1;
                    summary.published += published;
                }
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "failed to route event");
                    summary.failed += 1;
                    if let Err(e) = self.store.release_event(event.id).await {
                        warn!(event_id = %event.id, error = %e, "failed to release claim");
                    }
                }
            }
        }

        if summary.claimed > 0 {
            debug!(
                claimed = summary.claimed,
                routed = summary.routed,
                failed = summary.failed,
                published = summary.published,
                "routing pass finished"
            );
        }
        Ok(summary)
    }

    /// Routes one claimed event and publishes its queue items.
    ///
    /// Returns the number of queue items published.
    #[instrument(skip(self, event), fields(event_id = %event.id, channel = %event.channel))]
    async fn route_event(&self, event: &Event) -> Result<usize, EngineError> {
        let workflow = self
            .store
            .find_workflow(event.workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound {
                workflow_id: event.workflow_id,
            })?;

        let targets = workflow
            .graph
            .downstream(event.node_id, &event.channel, &event.data)
            .map_err(|error| WorkflowError::Graph {
                workflow_id: workflow.id,
                error,
            })?;

        let items = targets
            .into_iter()
            .map(|node_id| QueueItem::for_event(event, node_id))
            .collect();
        let items = self.store.route_event(event.id, items).await?;
        debug!(queue_items = items.len(), "event routed");

        Ok(self.publish(&items).await)
    }

    /// Publishes items that have not been published yet.
    ///
    /// Failures are logged and left for the reconciler.
    async fn publish(&self, items: &[QueueItem]) -> usize {
        let mut published = 0;
        for item in items.iter().filter(|item| !item.is_published()) {
            if let Err(e) = self.transport.publish(item).await {
                warn!(queue_item_id = %item.id, error = %e, "publish failed, leaving for reconciler");
                continue;
            }
            if let Err(e) = self.store.mark_published(item.id, Utc::now()).await {
                warn!(queue_item_id = %item.id, error = %e, "failed to mark queue item published");
            }
            published += 1;
        }
        published
    }

    /// Routes on a fixed interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_interval = ?self.config.poll_interval, "router started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.route_once().await {
                warn!(error = %e, "routing pass failed");
            }
        }
        info!("router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventState;
    use crate::memory::{MemoryStore, MemoryTransport};
    use crate::store::EventStore;
    use conveyor_core::{NodeId, OrganizationId};
    use conveyor_workflow::{Edge, Node, Workflow};
    use serde_json::json;

    fn router(store: &Arc<MemoryStore>, transport: &Arc<MemoryTransport>) -> Router<MemoryStore, MemoryTransport> {
        Router::new(Arc::clone(store), Arc::clone(transport), RouterConfig::default())
    }

    fn fan_out() -> (Workflow, NodeId) {
        let mut workflow = Workflow::new(OrganizationId::new(), "fan out");
        let trigger = workflow.graph.add_node(Node::trigger("start", "manual")).unwrap();
        let a = workflow.graph.add_node(Node::component("a", "noop")).unwrap();
        let b = workflow.graph.add_node(Node::component("b", "noop")).unwrap();
        workflow.graph.add_edge(trigger, a, Edge::default()).unwrap();
        workflow.graph.add_edge(trigger, b, Edge::default()).unwrap();
        (workflow, trigger)
    }

    #[tokio::test]
    async fn routes_and_publishes_in_declaration_order() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let (workflow, trigger) = fan_out();
        let a = workflow.graph.nodes().find(|n| n.name == "a").unwrap().id;
        store.insert_workflow(workflow.clone());

        let event = Event::root(workflow.id, trigger, "default", "manual", json!({}));
        store.create_event(&event).await.unwrap();

        let summary = router(&store, &transport).route_once().await.unwrap();
        assert_eq!(summary.routed, 1);
        assert_eq!(summary.published, 2);

        let published = transport.published();
        assert_eq!(published[0].node_id, a);
        assert!(store.queue_items().iter().all(QueueItem::is_published));
        assert_eq!(store.events()[0].state, EventState::Routed);
    }

    #[tokio::test]
    async fn no_match_routes_without_items() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let (workflow, trigger) = fan_out();
        store.insert_workflow(workflow.clone());

        let event = Event::root(workflow.id, trigger, "other", "manual", json!({}));
        store.create_event(&event).await.unwrap();

        router(&store, &transport).route_once().await.unwrap();
        assert!(store.queue_items().is_empty());
        assert_eq!(store.events()[0].state, EventState::Routed);
    }

    #[tokio::test]
    async fn missing_workflow_leaves_event_pending() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let event = Event::root(conveyor_core::WorkflowId::new(), NodeId::new(), "default", "manual", json!({}));
        store.create_event(&event).await.unwrap();

        let router = router(&store, &transport);
        let summary = router.route_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(store.events()[0].is_pending());

        // The claim was released, so the next pass sees it again.
        assert_eq!(router.route_once().await.unwrap().claimed, 1);
    }

    #[tokio::test]
    async fn publish_failure_keeps_routing() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let (workflow, trigger) = fan_out();
        store.insert_workflow(workflow.clone());
        let event = Event::root(workflow.id, trigger, "default", "manual", json!({}));
        store.create_event(&event).await.unwrap();

        transport.set_failing(true);
        let summary = router(&store, &transport).route_once().await.unwrap();
        assert_eq!(summary.routed, 1);
        assert_eq!(summary.published, 0);
        assert_eq!(store.queue_items().len(), 2);
        assert!(store.queue_items().iter().all(|item| !item.is_published()));
    }
}
