//! In-memory store and transport.
//!
//! Both keep the same guarantees as the production backends: routing and
//! execution transitions happen under one lock, and the transport redelivers
//! nacked items after a delay. Used by tests and for embedding the engine in
//! a single process.

use crate::error::{StoreError, TransportError};
use crate::event::{Event, EventState};
use crate::execution::{Execution, ExecutionState};
use crate::queue_item::QueueItem;
use crate::store::{
    CreateOutcome, EventStore, ExecutionStore, NodeMetadataStore, QueueItemStore, WorkflowStore,
};
use crate::transport::{Acknowledger, Deliveries, Delivery, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{EventId, ExecutionId, NodeId, QueueItemId, WorkflowId};
use conveyor_workflow::Workflow;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Delay before a nacked item is delivered again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct State {
    workflows: HashMap<WorkflowId, Workflow>,
    events: Vec<Event>,
    claims: HashMap<EventId, Instant>,
    queue_items: Vec<QueueItem>,
    executions: Vec<Execution>,
    metadata: HashMap<(WorkflowId, NodeId), JsonValue>,
}

/// A store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a workflow.
    pub fn insert_workflow(&self, workflow: Workflow) {
        lock(&self.state).workflows.insert(workflow.id, workflow);
    }

    /// Inserts queue items directly, bypassing routing.
    ///
    /// Leaves the event's state alone, which is what a routing attempt that
    /// died halfway looks like.
    pub fn insert_queue_items(&self, items: Vec<QueueItem>) {
        let mut state = lock(&self.state);
        for item in items {
            let exists = state
                .queue_items
                .iter()
                .any(|i| i.event_id == item.event_id && i.node_id == item.node_id);
            if !exists {
                state.queue_items.push(item);
            }
        }
    }

    /// Makes every operation fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns all events in insertion order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock(&self.state).events.clone()
    }

    /// Returns all queue items in insertion order.
    #[must_use]
    pub fn queue_items(&self) -> Vec<QueueItem> {
        lock(&self.state).queue_items.clone()
    }

    /// Returns all executions in insertion order.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        lock(&self.state).executions.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn find_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        self.check()?;
        Ok(lock(&self.state).workflows.get(&id).cloned())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_event(&self, event: &Event) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.state).events.push(event.clone());
        Ok(())
    }

    async fn create_events(&self, events: &[Event]) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.state).events.extend(events.iter().cloned());
        Ok(())
    }

    async fn find_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        self.check()?;
        Ok(lock(&self.state).events.iter().find(|e| e.id == id).cloned())
    }

    async fn claim_pending_events(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Event>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut state = lock(&self.state);
        let State { events, claims, .. } = &mut *state;

        let mut claimed = Vec::new();
        for event in events.iter().filter(|e| e.is_pending()) {
            if claimed.len() >= limit {
                break;
            }
            if claims.get(&event.id).is_some_and(|until| *until > now) {
                continue;
            }
            claims.insert(event.id, now + lease);
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn release_event(&self, id: EventId) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.state).claims.remove(&id);
        Ok(())
    }

    async fn route_event(
        &self,
        event_id: EventId,
        items: Vec<QueueItem>,
    ) -> Result<Vec<QueueItem>, StoreError> {
        self.check()?;
        let mut state = lock(&self.state);

        for item in items {
            let exists = state
                .queue_items
                .iter()
                .any(|i| i.event_id == item.event_id && i.node_id == item.node_id);
            if !exists {
                state.queue_items.push(item);
            }
        }
        if let Some(event) = state.events.iter_mut().find(|e| e.id == event_id) {
            event.state = EventState::Routed;
        }
        state.claims.remove(&event_id);

        Ok(state
            .queue_items
            .iter()
            .filter(|i| i.event_id == event_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueueItemStore for MemoryStore {
    async fn find_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        self.check()?;
        Ok(lock(&self.state)
            .queue_items
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }

    async fn list_unpublished(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        self.check()?;
        Ok(lock(&self.state)
            .queue_items
            .iter()
            .filter(|i| !i.is_published() && i.created_at < created_before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_unexecuted(
        &self,
        published_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        self.check()?;
        let state = lock(&self.state);
        Ok(state
            .queue_items
            .iter()
            .filter(|i| i.published_at.is_some_and(|at| at < published_before))
            .filter(|i| !state.executions.iter().any(|e| e.queue_item_id == i.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: QueueItemId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        if let Some(item) = lock(&self.state)
            .queue_items
            .iter_mut()
            .find(|i| i.id == id)
        {
            item.published_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution_if_absent(
        &self,
        execution: &Execution,
    ) -> Result<CreateOutcome, StoreError> {
        self.check()?;
        let mut state = lock(&self.state);
        if let Some(existing) = state
            .executions
            .iter()
            .find(|e| e.queue_item_id == execution.queue_item_id)
        {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        state.executions.push(execution.clone());
        Ok(CreateOutcome::Created(execution.clone()))
    }

    async fn find_execution(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        self.check()?;
        Ok(lock(&self.state)
            .executions
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn find_execution_by_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Option<Execution>, StoreError> {
        self.check()?;
        Ok(lock(&self.state)
            .executions
            .iter()
            .find(|e| e.queue_item_id == queue_item_id)
            .cloned())
    }

    async fn transition_execution(
        &self,
        execution: &Execution,
        expected: ExecutionState,
    ) -> Result<bool, StoreError> {
        self.finish_execution(execution, expected, &[]).await
    }

    async fn finish_execution(
        &self,
        execution: &Execution,
        expected: ExecutionState,
        events: &[Event],
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = lock(&self.state);
        let Some(stored) = state.executions.iter_mut().find(|e| e.id == execution.id) else {
            return Ok(false);
        };
        if stored.state != expected {
            return Ok(false);
        }
        *stored = execution.clone();
        state.events.extend(events.iter().cloned());
        Ok(true)
    }

    async fn touch_execution(
        &self,
        id: ExecutionId,
        expected: ExecutionState,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = lock(&self.state);
        match state
            .executions
            .iter_mut()
            .find(|e| e.id == id && e.state == expected)
        {
            Some(stored) => {
                stored.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_executions(
        &self,
        state: ExecutionState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        self.check()?;
        let mut matching: Vec<_> = lock(&self.state)
            .executions
            .iter()
            .filter(|e| e.state == state && e.updated_at < updated_before)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.updated_at);
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl NodeMetadataStore for MemoryStore {
    async fn find_node_metadata(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<Option<JsonValue>, StoreError> {
        self.check()?;
        Ok(lock(&self.state)
            .metadata
            .get(&(workflow_id, node_id))
            .cloned())
    }

    async fn save_node_metadata(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
        metadata: &JsonValue,
    ) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.state)
            .metadata
            .insert((workflow_id, node_id), metadata.clone());
        Ok(())
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
}

type SettlementLog = Arc<Mutex<Vec<(QueueItemId, Settlement)>>>;

/// A transport backed by an unbounded channel.
pub struct MemoryTransport {
    sender: mpsc::UnboundedSender<QueueItem>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<QueueItem>>>,
    published: Mutex<Vec<QueueItem>>,
    settlements: SettlementLog,
    failing: AtomicBool,
    redelivery_delay: Duration,
}

impl MemoryTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            published: Mutex::new(Vec::new()),
            settlements: Arc::new(Mutex::new(Vec::new())),
            failing: AtomicBool::new(false),
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
        }
    }

    /// Sets how long a nacked item waits before it is delivered again.
    #[must_use]
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Makes `publish` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns every successfully published item, in order.
    #[must_use]
    pub fn published(&self) -> Vec<QueueItem> {
        lock(&self.published).clone()
    }

    /// Returns how each settled delivery was settled, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<(QueueItemId, Settlement)> {
        lock(&self.settlements).clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryAcknowledger {
    item: QueueItem,
    sender: mpsc::UnboundedSender<QueueItem>,
    settlements: SettlementLog,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> Result<(), TransportError> {
        lock(&self.settlements).push((self.item.id, Settlement::Acked));
        Ok(())
    }

    async fn nack(&self) -> Result<(), TransportError> {
        if self.sender.is_closed() {
            return Err(TransportError::AckFailed {
                message: "memory transport consumer is gone".to_string(),
            });
        }
        lock(&self.settlements).push((self.item.id, Settlement::Nacked));

        let item = self.item.clone();
        let sender = self.sender.clone();
        let delay = self.redelivery_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(item).is_err() {
                debug!("dropping redelivery, consumer is gone");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, item: &QueueItem) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                message: "memory transport marked failing".to_string(),
            });
        }
        self.sender
            .send(item.clone())
            .map_err(|e| TransportError::PublishFailed {
                message: e.to_string(),
            })?;
        lock(&self.published).push(item.clone());
        Ok(())
    }

    async fn consume(&self) -> Result<Deliveries, TransportError> {
        let receiver = lock(&self.receiver)
            .take()
            .ok_or_else(|| TransportError::ReceiveFailed {
                message: "memory transport already has a consumer".to_string(),
            })?;
        let sender = self.sender.clone();
        let settlements = Arc::clone(&self.settlements);
        let redelivery_delay = self.redelivery_delay;

        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let sender = sender.clone();
            let settlements = Arc::clone(&settlements);
            async move {
                let item = receiver.recv().await?;
                let delivery = Delivery::new(
                    item.clone(),
                    MemoryAcknowledger {
                        item,
                        sender,
                        settlements,
                        redelivery_delay,
                    },
                );
                Some((Ok(delivery), receiver))
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_event() -> Event {
        Event::root(WorkflowId::new(), NodeId::new(), "default", "push", json!({}))
    }

    #[tokio::test]
    async fn claims_hide_events_until_released() {
        let store = MemoryStore::new();
        let event = pending_event();
        store.create_event(&event).await.unwrap();

        let lease = Duration::from_secs(30);
        assert_eq!(store.claim_pending_events(10, lease).await.unwrap().len(), 1);
        assert!(store.claim_pending_events(10, lease).await.unwrap().is_empty());

        store.release_event(event.id).await.unwrap();
        assert_eq!(store.claim_pending_events(10, lease).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_claims_are_reclaimable() {
        let store = MemoryStore::new();
        store.create_event(&pending_event()).await.unwrap();

        store
            .claim_pending_events(10, Duration::ZERO)
            .await
            .unwrap();
        let again = store
            .claim_pending_events(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn route_event_skips_existing_pairs() {
        let store = MemoryStore::new();
        let event = pending_event();
        store.create_event(&event).await.unwrap();
        let node = NodeId::new();

        store
            .route_event(event.id, vec![QueueItem::for_event(&event, node)])
            .await
            .unwrap();
        let items = store
            .route_event(event.id, vec![QueueItem::for_event(&event, node)])
            .await
            .unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(store.queue_items().len(), 1);
        let stored = store.find_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.state, EventState::Routed);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let event = pending_event();
        let item = QueueItem::for_event(&event, NodeId::new());
        let execution = Execution::new(&item, json!({}));
        store.create_execution_if_absent(&execution).await.unwrap();

        let mut running = execution.clone();
        running.start().unwrap();
        assert!(
            store
                .transition_execution(&running, ExecutionState::Pending)
                .await
                .unwrap()
        );
        assert!(
            !store
                .transition_execution(&running, ExecutionState::Pending)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn touch_only_refreshes_the_expected_state() {
        let store = MemoryStore::new();
        let event = pending_event();
        let item = QueueItem::for_event(&event, NodeId::new());
        let mut execution = Execution::new(&item, json!({}));
        execution.start().unwrap();
        store.create_execution_if_absent(&execution).await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert!(
            store
                .touch_execution(execution.id, ExecutionState::Running, later)
                .await
                .unwrap()
        );
        assert_eq!(store.executions()[0].updated_at, later);
        assert!(
            !store
                .touch_execution(execution.id, ExecutionState::Waiting, Utc::now())
                .await
                .unwrap()
        );
        assert_eq!(store.executions()[0].updated_at, later);
    }

    #[tokio::test]
    async fn batch_event_insert_keeps_order() {
        let store = MemoryStore::new();
        let events = vec![pending_event(), pending_event()];
        store.create_events(&events).await.unwrap();
        assert_eq!(store.events(), events);

        store.set_unavailable(true);
        assert!(store.create_events(&[pending_event()]).await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_operations() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.find_event(EventId::new()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn nack_redelivers_after_delay() {
        let transport = MemoryTransport::new().with_redelivery_delay(Duration::from_millis(50));
        let event = pending_event();
        let item = QueueItem::for_event(&event, NodeId::new());
        transport.publish(&item).await.unwrap();

        let mut deliveries = transport.consume().await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        let nacked_at = Instant::now();
        first.nack().await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(nacked_at.elapsed() >= Duration::from_millis(50));
        assert_eq!(second.item().id, item.id);
        second.ack().await.unwrap();

        assert_eq!(
            transport.settlements(),
            vec![(item.id, Settlement::Nacked), (item.id, Settlement::Acked)]
        );
    }

    #[tokio::test]
    async fn single_consumer_only() {
        let transport = MemoryTransport::new();
        let _deliveries = transport.consume().await.unwrap();
        assert!(transport.consume().await.is_err());
    }
}
