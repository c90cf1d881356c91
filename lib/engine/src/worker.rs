//! Queue worker.
//!
//! The worker:
//! 1. Receives queue items from the transport
//! 2. Creates the execution for each item, keyed by the queue item ID
//! 3. Hands pending executions to the node executor
//! 4. Acks settled work and nacks work that hit a transient failure
//!
//! Deliveries run on their own tasks so a slow component never holds up the
//! rest of the stream.

use crate::error::EngineError;
use crate::executor::NodeExecutor;
use crate::execution::{Execution, ExecutionState};
use crate::queue_item::QueueItem;
use crate::registry::Registry;
use crate::store::{CreateOutcome, Store};
use crate::transport::{Delivery, Transport};
use conveyor_workflow::{Node, WorkflowError};
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default number of deliveries processed at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// What happened to a delivered queue item.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// The execution reached the returned state.
    Executed(Execution),
    /// The item was already being handled or finished by another delivery.
    Duplicate,
}

/// Consumes queue items and drives their executions.
pub struct Worker<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    executor: NodeExecutor<S>,
    max_concurrency: usize,
}

impl<S: Store + 'static, T: Transport + 'static> Worker<S, T> {
    /// Creates a worker.
    pub fn new(store: Arc<S>, transport: Arc<T>, registry: Arc<Registry>) -> Self {
        let executor = NodeExecutor::new(Arc::clone(&store), registry);
        Self {
            store,
            transport,
            executor,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Sets how many deliveries may be processed at once.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets how often running executions are marked alive.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.executor = self.executor.with_heartbeat(heartbeat);
        self
    }

    /// Handles one queue item.
    ///
    /// A queue item whose event, workflow or node no longer exists can never
    /// succeed, so its execution is created and failed right away.
    ///
    /// # Errors
    ///
    /// Returns an error for store failures; the delivery should be retried.
    #[instrument(skip(self, item), fields(queue_item_id = %item.id, node_id = %item.node_id))]
    pub async fn handle(&self, item: &QueueItem) -> Result<Handled, EngineError> {
        if let Some(existing) = self.store.find_execution_by_queue_item(item.id).await? {
            if existing.state != ExecutionState::Pending {
                debug!(state = %existing.state, "queue item already handled");
                return Ok(Handled::Duplicate);
            }
        }

        let (node, input) = match self.resolve(item).await {
            Ok(resolved) => resolved,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.reject(item, e).await,
        };

        let execution = Execution::new(item, input);
        let execution = match self.store.create_execution_if_absent(&execution).await? {
            CreateOutcome::Created(execution) => execution,
            CreateOutcome::Existing(existing) if existing.state == ExecutionState::Pending => {
                existing
            }
            CreateOutcome::Existing(_) => return Ok(Handled::Duplicate),
        };

        match self.executor.run(execution, &node).await? {
            Some(execution) => Ok(Handled::Executed(execution)),
            None => Ok(Handled::Duplicate),
        }
    }

    async fn resolve(
        &self,
        item: &QueueItem,
    ) -> Result<(Node, JsonValue), EngineError> {
        let event = self
            .store
            .find_event(item.event_id)
            .await?
            .ok_or(EngineError::EventNotFound {
                event_id: item.event_id,
            })?;
        let workflow = self
            .store
            .find_workflow(item.workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound {
                workflow_id: item.workflow_id,
            })?;
        let node = workflow.node(item.node_id)?.clone();
        Ok((node, event.data))
    }

    /// Records a permanently failed execution for an unresolvable item.
    async fn reject(&self, item: &QueueItem, reason: EngineError) -> Result<Handled, EngineError> {
        warn!(error = %reason, "queue item cannot be resolved");
        let execution = Execution::new(item, JsonValue::Null);
        let mut execution = match self.store.create_execution_if_absent(&execution).await? {
            CreateOutcome::Created(execution) => execution,
            CreateOutcome::Existing(existing) if existing.state == ExecutionState::Pending => {
                existing
            }
            CreateOutcome::Existing(_) => return Ok(Handled::Duplicate),
        };

        execution.fail(reason.to_string())?;
        if self
            .store
            .transition_execution(&execution, ExecutionState::Pending)
            .await?
        {
            Ok(Handled::Executed(execution))
        } else {
            Ok(Handled::Duplicate)
        }
    }

    async fn settle(&self, delivery: Delivery) {
        let item_id = delivery.item().id;
        let handled = self.handle(delivery.item()).await;
        let result = match handled {
            Ok(Handled::Executed(execution)) => {
                debug!(queue_item_id = %item_id, state = %execution.state, "queue item handled");
                delivery.ack().await
            }
            Ok(Handled::Duplicate) => delivery.ack().await,
            Err(e) if e.is_transient() => {
                warn!(queue_item_id = %item_id, error = %e, "transient failure, redelivering");
                delivery.nack().await
            }
            Err(e) => {
                error!(queue_item_id = %item_id, error = %e, "queue item failed permanently");
                delivery.ack().await
            }
        };
        if let Err(e) = result {
            warn!(queue_item_id = %item_id, error = %e, "failed to settle delivery");
        }
    }

    /// Consumes deliveries until `cancel` fires or the stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot start consuming.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut deliveries = self.transport.consume().await?;
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        info!(max_concurrency = self.max_concurrency, "worker started");

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };
            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "failed to receive delivery");
                    continue;
                }
                None => break,
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.settle(delivery).await;
                drop(permit);
            });
        }

        // Wait for in-flight deliveries before returning.
        let all = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(all).await;
        info!("worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ExecutionContext};
    use crate::configuration::Configuration;
    use crate::error::ComponentError;
    use crate::event::Event;
    use crate::memory::{MemoryStore, MemoryTransport, Settlement};
    use crate::store::EventStore;
    use async_trait::async_trait;
    use conveyor_core::{OrganizationId, QueueItemId};
    use conveyor_workflow::Workflow;
    use serde_json::json;

    struct Misconfigured;

    #[async_trait]
    impl Component for Misconfigured {
        fn name(&self) -> &str {
            "misconfigured"
        }

        fn setup(&self, _config: &Configuration) -> Result<(), ComponentError> {
            panic!("setup exploded");
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
            Ok(())
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::with_builtins().with_component(Misconfigured))
    }

    fn worker(store: &Arc<MemoryStore>) -> Worker<MemoryStore, MemoryTransport> {
        Worker::new(Arc::clone(store), Arc::new(MemoryTransport::new()), registry())
    }

    /// One workflow with a step per component, and a root event queued to
    /// each step.
    async fn queued_for(store: &MemoryStore, references: &[&str]) -> Vec<QueueItem> {
        let mut workflow = Workflow::new(OrganizationId::new(), "test");
        let trigger = workflow.graph.add_node(Node::trigger("start", "manual")).unwrap();
        let steps: Vec<_> = references
            .iter()
            .map(|reference| {
                workflow
                    .graph
                    .add_node(Node::component(*reference, *reference))
                    .unwrap()
            })
            .collect();
        store.insert_workflow(workflow.clone());

        let event = Event::root(workflow.id, trigger, "default", "manual", json!("hello"));
        store.create_event(&event).await.unwrap();
        steps
            .into_iter()
            .map(|step| QueueItem::for_event(&event, step))
            .collect()
    }

    async fn queued(store: &MemoryStore) -> QueueItem {
        queued_for(store, &["noop"]).await.remove(0)
    }

    struct Running {
        transport: Arc<MemoryTransport>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<(), EngineError>>,
    }

    impl Running {
        fn start(store: &Arc<MemoryStore>, transport: MemoryTransport) -> Self {
            let transport = Arc::new(transport);
            let worker = Arc::new(
                Worker::new(Arc::clone(store), Arc::clone(&transport), registry())
                    .with_max_concurrency(1),
            );
            let cancel = CancellationToken::new();
            let task = tokio::spawn(worker.run(cancel.clone()));
            Self {
                transport,
                cancel,
                task,
            }
        }

        /// Waits until the settlement log satisfies `done`.
        async fn settled_until(
            &self,
            done: impl Fn(&[(QueueItemId, Settlement)]) -> bool,
        ) -> Vec<(QueueItemId, Settlement)> {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let settlements = self.transport.settlements();
                    if done(&settlements) {
                        return settlements;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("deliveries were not settled in time")
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn executes_and_then_drops_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store);
        let item = queued(&store).await;

        let Handled::Executed(execution) = worker.handle(&item).await.unwrap() else {
            panic!("expected an execution");
        };
        assert_eq!(execution.state, ExecutionState::Completed);
        assert_eq!(execution.input_data, json!("hello"));

        assert_eq!(worker.handle(&item).await.unwrap(), Handled::Duplicate);
        assert_eq!(store.executions().len(), 1);
    }

    #[tokio::test]
    async fn missing_event_fails_execution() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store);
        let mut item = queued(&store).await;
        item.event_id = conveyor_core::EventId::new();

        let Handled::Executed(execution) = worker.handle(&item).await.unwrap() else {
            panic!("expected an execution");
        };
        assert_eq!(execution.state, ExecutionState::Failed);
        assert!(execution.error_message.unwrap().starts_with("event not found"));
    }

    #[tokio::test]
    async fn unavailable_store_is_transient() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(&store);
        let item = queued(&store).await;

        store.set_unavailable(true);
        let err = worker.handle(&item).await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.executions().is_empty());
    }

    #[tokio::test]
    async fn run_acks_completed_waiting_and_duplicate_items() {
        let store = Arc::new(MemoryStore::new());
        let items = queued_for(&store, &["noop", "approval"]).await;
        let (noop, approval) = (&items[0], &items[1]);

        let running = Running::start(&store, MemoryTransport::new());
        for item in [noop, approval, noop] {
            running.transport.publish(item).await.unwrap();
        }
        let settlements = running.settled_until(|s| s.len() == 3).await;
        running.stop().await;

        assert_eq!(
            settlements,
            vec![
                (noop.id, Settlement::Acked),
                (approval.id, Settlement::Acked),
                (noop.id, Settlement::Acked),
            ]
        );
        let state_of = |id| {
            store
                .executions()
                .into_iter()
                .find(|e| e.queue_item_id == id)
                .map(|e| e.state)
        };
        assert_eq!(state_of(noop.id), Some(ExecutionState::Completed));
        assert_eq!(state_of(approval.id), Some(ExecutionState::Waiting));
        assert_eq!(store.executions().len(), 2);
    }

    #[tokio::test]
    async fn run_nacks_until_the_store_is_back() {
        let store = Arc::new(MemoryStore::new());
        let item = queued(&store).await;
        store.set_unavailable(true);

        let transport = MemoryTransport::new().with_redelivery_delay(Duration::from_millis(20));
        let running = Running::start(&store, transport);
        running.transport.publish(&item).await.unwrap();

        let outage = running.settled_until(|s| s.len() >= 2).await;
        assert!(outage.iter().all(|(_, s)| *s == Settlement::Nacked));

        store.set_unavailable(false);
        let settlements = running
            .settled_until(|s| s.last().is_some_and(|(_, s)| *s == Settlement::Acked))
            .await;
        running.stop().await;

        let (acked, nacked) = settlements.split_last().unwrap();
        assert_eq!(*acked, (item.id, Settlement::Acked));
        assert!(nacked.iter().all(|entry| *entry == (item.id, Settlement::Nacked)));
        assert_eq!(store.executions()[0].state, ExecutionState::Completed);
    }

    #[tokio::test]
    async fn run_acks_items_whose_setup_panics() {
        let store = Arc::new(MemoryStore::new());
        let item = queued_for(&store, &["misconfigured"]).await.remove(0);

        let running = Running::start(&store, MemoryTransport::new());
        running.transport.publish(&item).await.unwrap();
        let settlements = running.settled_until(|s| !s.is_empty()).await;
        running.stop().await;

        assert_eq!(settlements, vec![(item.id, Settlement::Acked)]);
        let execution = &store.executions()[0];
        assert_eq!(execution.state, ExecutionState::Failed);
        assert!(
            execution
                .error_message
                .as_deref()
                .is_some_and(|message| message.contains("setup exploded"))
        );
    }
}
