//! Node executor.
//!
//! Drives a single execution through its state machine. Every persisted
//! transition is a compare-and-set on the state the executor started from, so
//! a second delivery of the same queue item, a late cancel or a reaper sweep
//! can never overwrite a terminal state.
//!
//! Component code runs on its own Tokio task, from configuration checks and
//! `setup` through the execution hooks. A panic inside any of it is observed
//! through the join handle and recorded as a failed execution. While a hook
//! runs, the executor keeps bumping the execution's `updated_at` so the
//! reaper only sees executions whose worker is gone.

use crate::component::{Component, ExecutionContext, Processing, WebhookRequest};
use crate::error::{ComponentError, EngineError};
use crate::event::{Event, event_data};
use crate::execution::{Execution, ExecutionOutput, ExecutionState};
use crate::registry::Registry;
use crate::store::Store;
use chrono::Utc;
use conveyor_core::ExecutionId;
use conveyor_workflow::{Node, WorkflowError};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic payload".to_string()
}

pub(crate) fn join_failure(error: JoinError) -> ComponentError {
    if error.is_panic() {
        ComponentError::Panicked {
            message: panic_message(error.into_panic()),
        }
    } else {
        ComponentError::failed(format!("component task was cancelled: {error}"))
    }
}

/// Runs a component or trigger hook on its own task and hands the context
/// back.
pub(crate) async fn invoke<C, T, F>(future: F) -> Result<(C, T), ComponentError>
where
    C: Send + 'static,
    T: Send + 'static,
    F: Future<Output = (C, Result<T, ComponentError>)> + Send + 'static,
{
    match tokio::spawn(future).await {
        Ok((ctx, Ok(value))) => Ok((ctx, value)),
        Ok((_, Err(e))) => Err(e),
        Err(e) => Err(join_failure(e)),
    }
}

/// How often a running execution's `updated_at` is refreshed by default.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Executes component logic for executions and records the outcome.
pub struct NodeExecutor<S> {
    store: Arc<S>,
    registry: Arc<Registry>,
    heartbeat: Duration,
}

impl<S> Clone for NodeExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            heartbeat: self.heartbeat,
        }
    }
}

impl<S: Store> NodeExecutor<S> {
    /// Creates an executor.
    pub fn new(store: Arc<S>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Sets how often running executions are marked alive. Must stay well
    /// below the reaper's stale TTL.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat.max(Duration::from_millis(1));
        self
    }

    /// Looks up the component for a node and builds its invocation context.
    ///
    /// Schema validation, `setup` and the channel list all run on a
    /// separate task; a panic in any of them comes back as
    /// `ComponentError::Panicked`.
    async fn prepare(
        &self,
        node: &Node,
        execution: &Execution,
    ) -> Result<(Arc<dyn Component>, ExecutionContext), EngineError> {
        let component =
            self.registry
                .component(&node.reference)
                .ok_or_else(|| EngineError::UnknownComponent {
                    name: node.reference.clone(),
                })?;

        let hooks = Arc::clone(&component);
        let raw = node.configuration.clone();
        let (configuration, channels) = tokio::spawn(async move {
            let configuration = hooks.configuration().validate(&raw)?;
            hooks.setup(&configuration)?;
            let channels = hooks.output_channels(&configuration);
            Ok::<_, ComponentError>((configuration, channels))
        })
        .await
        .map_err(join_failure)??;

        let ctx = ExecutionContext::new(execution, configuration, channels);
        Ok((component, ctx))
    }

    /// Runs a hook for a running execution, refreshing the execution's
    /// `updated_at` every heartbeat until the hook returns.
    async fn supervise<T, F>(
        &self,
        execution_id: ExecutionId,
        hook: F,
    ) -> Result<(ExecutionContext, T), ComponentError>
    where
        T: Send + 'static,
        F: Future<Output = (ExecutionContext, Result<T, ComponentError>)> + Send + 'static,
    {
        let hook = invoke(hook);
        tokio::pin!(hook);
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut hook => return outcome,
                _ = heartbeat.tick() => self.beat(execution_id).await,
            }
        }
    }

    async fn beat(&self, execution_id: ExecutionId) {
        match self
            .store
            .touch_execution(execution_id, ExecutionState::Running, Utc::now())
            .await
        {
            Ok(true) => debug!(%execution_id, "execution heartbeat"),
            Ok(false) => debug!(%execution_id, "execution no longer running"),
            Err(e) => warn!(%execution_id, error = %e, "execution heartbeat failed"),
        }
    }

    /// Runs a pending execution.
    ///
    /// Returns `None` when the execution is not pending or another delivery
    /// claimed it first; the caller treats that as a duplicate.
    ///
    /// # Errors
    ///
    /// Returns an error only for store failures. Component failures are
    /// recorded on the execution.
    #[instrument(skip(self, execution, node), fields(execution_id = %execution.id, component = %node.reference))]
    pub async fn run(
        &self,
        mut execution: Execution,
        node: &Node,
    ) -> Result<Option<Execution>, EngineError> {
        if execution.state != ExecutionState::Pending {
            debug!(state = %execution.state, "execution is not pending");
            return Ok(None);
        }

        let (component, ctx) = match self.prepare(node, &execution).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "execution cannot start");
                execution.fail(e.to_string())?;
                return self
                    .commit(execution, ExecutionState::Pending, &[])
                    .await
                    .map(Some);
            }
        };

        execution.start()?;
        if !self
            .store
            .transition_execution(&execution, ExecutionState::Pending)
            .await?
        {
            debug!("execution claimed by another delivery");
            return Ok(None);
        }

        let processing = {
            let component = Arc::clone(&component);
            self.supervise(execution.id, async move {
                let result = component.process_queue_item(&ctx).await;
                (ctx, result)
            })
            .await
        };

        let outcome = match processing {
            Ok((_, Processing::Await)) => {
                execution.suspend()?;
                return self
                    .commit(execution, ExecutionState::Running, &[])
                    .await
                    .map(Some);
            }
            Ok((mut ctx, Processing::Execute)) => self
                .supervise(execution.id, async move {
                    let result = component.execute(&mut ctx).await;
                    (ctx, result)
                })
                .await
                .map(|(ctx, ())| ctx),
            Err(e) => Err(e),
        };

        self.finalize(execution, outcome).await.map(Some)
    }

    /// Cancels a running or waiting execution.
    ///
    /// The component's cancel hook is called first; its failure is logged and
    /// the execution is canceled anyway.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution does not exist or is in any other
    /// state.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<Execution, EngineError> {
        let mut execution = self.load_execution(execution_id).await?;
        let expected = execution.state;
        if !matches!(expected, ExecutionState::Running | ExecutionState::Waiting) {
            return Err(EngineError::InvalidState {
                execution_id,
                state: expected,
            });
        }

        match self.prepare_for(&execution).await {
            Ok((component, ctx)) => {
                let hook = invoke(async move {
                    let result = component.cancel(&ctx).await;
                    (ctx, result)
                })
                .await;
                if let Err(e) = hook {
                    warn!(error = %e, "cancel hook failed");
                }
            }
            Err(e) => warn!(error = %e, "skipping cancel hook"),
        }

        execution.cancel()?;
        self.commit(execution, expected, &[]).await
    }

    /// Resumes a waiting execution with a user action.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not waiting or its component
    /// cannot be resolved.
    #[instrument(skip(self, parameters))]
    pub async fn handle_action(
        &self,
        execution_id: ExecutionId,
        action: &str,
        parameters: JsonValue,
    ) -> Result<Execution, EngineError> {
        let (execution, component, ctx) = self.resume(execution_id).await?;
        let action = action.to_string();
        let outcome = self
            .supervise(execution.id, async move {
                let mut ctx = ctx;
                let result = component.handle_action(&mut ctx, &action, &parameters).await;
                (ctx, result)
            })
            .await
            .map(|(ctx, ())| ctx);
        self.finalize(execution, outcome).await
    }

    /// Resumes a waiting execution with an inbound callback.
    ///
    /// Returns the HTTP status chosen by the component, or 500 if the
    /// component failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not waiting or its component
    /// cannot be resolved.
    #[instrument(skip(self, request))]
    pub async fn handle_webhook(
        &self,
        execution_id: ExecutionId,
        request: WebhookRequest,
    ) -> Result<(u16, Execution), EngineError> {
        let (execution, component, ctx) = self.resume(execution_id).await?;
        let result = self
            .supervise(execution.id, async move {
                let mut ctx = ctx;
                let result = component.handle_webhook(&mut ctx, &request).await;
                (ctx, result)
            })
            .await;

        let (status, outcome) = match result {
            Ok((ctx, status)) => (status, Ok(ctx)),
            Err(e) => (500, Err(e)),
        };
        let execution = self.finalize(execution, outcome).await?;
        Ok((status, execution))
    }

    /// Moves a waiting execution back to running for a resumption hook.
    async fn resume(
        &self,
        execution_id: ExecutionId,
    ) -> Result<(Execution, Arc<dyn Component>, ExecutionContext), EngineError> {
        let mut execution = self.load_execution(execution_id).await?;
        if execution.state != ExecutionState::Waiting {
            return Err(EngineError::InvalidState {
                execution_id,
                state: execution.state,
            });
        }

        let (component, ctx) = self.prepare_for(&execution).await?;

        execution.start()?;
        if !self
            .store
            .transition_execution(&execution, ExecutionState::Waiting)
            .await?
        {
            let current = self.load_execution(execution_id).await?;
            return Err(EngineError::InvalidState {
                execution_id,
                state: current.state,
            });
        }
        Ok((execution, component, ctx))
    }

    async fn load_execution(&self, execution_id: ExecutionId) -> Result<Execution, EngineError> {
        self.store
            .find_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound { execution_id })
    }

    async fn prepare_for(
        &self,
        execution: &Execution,
    ) -> Result<(Arc<dyn Component>, ExecutionContext), EngineError> {
        let workflow = self
            .store
            .find_workflow(execution.workflow_id)
            .await?
            .ok_or(WorkflowError::NotFound {
                workflow_id: execution.workflow_id,
            })?;
        let node = workflow.node(execution.node_id)?;
        self.prepare(node, execution).await
    }

    /// Records the outcome of a component invocation on a running execution.
    async fn finalize(
        &self,
        mut execution: Execution,
        outcome: Result<ExecutionContext, ComponentError>,
    ) -> Result<Execution, EngineError> {
        let mut events = Vec::new();
        match outcome {
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "execution failed");
                execution.fail(e.to_string())?;
            }
            Ok(ctx) if ctx.is_suspended() => execution.suspend()?,
            Ok(ctx) => {
                let mut output = ExecutionOutput::new();
                for emission in ctx.emissions() {
                    events.push(Event::emitted(
                        &execution,
                        emission.channel.clone(),
                        emission.event_type.clone(),
                        event_data(&emission.payloads),
                    ));
                    output.insert(emission.channel.clone(), emission.payloads.clone());
                }
                execution.complete(output)?;
            }
        }
        self.commit(execution, ExecutionState::Running, &events)
            .await
    }

    /// Persists a transition, falling back to the stored execution when
    /// another writer moved it first.
    async fn commit(
        &self,
        execution: Execution,
        expected: ExecutionState,
        events: &[Event],
    ) -> Result<Execution, EngineError> {
        if self
            .store
            .finish_execution(&execution, expected, events)
            .await?
        {
            info!(
                execution_id = %execution.id,
                state = %execution.state,
                events = events.len(),
                "execution updated"
            );
            return Ok(execution);
        }

        warn!(
            execution_id = %execution.id,
            expected = %expected,
            "execution changed concurrently, result discarded"
        );
        self.load_execution(execution.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Configuration;
    use crate::memory::MemoryStore;
    use crate::queue_item::QueueItem;
    use crate::reaper::{Reaper, ReaperConfig};
    use crate::store::{ExecutionStore, WorkflowStore};
    use async_trait::async_trait;
    use conveyor_core::OrganizationId;
    use conveyor_workflow::Workflow;
    use serde_json::json;

    struct Exploding;

    #[async_trait]
    impl Component for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
            panic!("boom");
        }
    }

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

    struct Slow;

    #[async_trait]
    impl Component for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
            tokio::time::sleep(Duration::from_millis(400)).await;
            ctx.emit("default", "slow.done", vec![json!("done")])
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Component for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
            Err(ComponentError::failed("semaphore: 502 Bad Gateway"))
        }
    }

    async fn setup(reference: &str) -> (NodeExecutor<MemoryStore>, Arc<MemoryStore>, Execution, Node) {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::with_builtins()
            .with_component(Exploding)
            .with_component(Misconfigured)
            .with_component(Slow)
            .with_component(Unreachable);

        let mut workflow = Workflow::new(OrganizationId::new(), "test");
        let trigger = workflow.graph.add_node(Node::trigger("start", "manual")).unwrap();
        let node = Node::component("step", reference);
        workflow.graph.add_node(node.clone()).unwrap();
        store.insert_workflow(workflow.clone());
        assert!(store.find_workflow(workflow.id).await.unwrap().is_some());

        let event = Event::root(workflow.id, trigger, "default", "manual", json!({"n": 1}));
        let item = QueueItem::for_event(&event, node.id);
        let execution = Execution::new(&item, event.data);
        store.create_execution_if_absent(&execution).await.unwrap();

        (
            NodeExecutor::new(Arc::clone(&store), Arc::new(registry)),
            store,
            execution,
            node,
        )
    }

    #[tokio::test]
    async fn noop_completes_with_output() {
        let (executor, store, execution, node) = setup("noop").await;
        let done = executor.run(execution, &node).await.unwrap().unwrap();

        assert_eq!(done.state, ExecutionState::Completed);
        assert_eq!(done.output_data.unwrap()["default"], vec![json!({"n": 1})]);
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].execution_id, Some(done.id));
        assert_eq!(events[0].data, json!({"n": 1}));
    }

    #[tokio::test]
    async fn upstream_error_message_is_preserved() {
        let (executor, store, execution, node) = setup("unreachable").await;
        let done = executor.run(execution, &node).await.unwrap().unwrap();

        assert_eq!(done.state, ExecutionState::Failed);
        assert_eq!(done.error_message.as_deref(), Some("semaphore: 502 Bad Gateway"));
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let (executor, _store, execution, node) = setup("exploding").await;
        let done = executor.run(execution, &node).await.unwrap().unwrap();

        assert_eq!(done.state, ExecutionState::Failed);
        assert!(done.error_message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn setup_panic_fails_from_pending() {
        let (executor, store, execution, node) = setup("misconfigured").await;
        let done = executor.run(execution, &node).await.unwrap().unwrap();

        assert_eq!(done.state, ExecutionState::Failed);
        assert!(done.error_message.unwrap().contains("setup exploded"));
        assert_eq!(store.executions()[0].state, ExecutionState::Failed);
    }

    #[tokio::test]
    async fn heartbeat_outlives_the_stale_sweep() {
        let (executor, store, execution, node) = setup("slow").await;
        let executor = executor.with_heartbeat(Duration::from_millis(20));
        let reaper = Reaper::new(
            Arc::clone(&store),
            ReaperConfig {
                interval: Duration::from_millis(25),
                stale_ttl: Duration::from_millis(150),
                ..ReaperConfig::default()
            },
        );
        let cancel = tokio_util::sync::CancellationToken::new();
        let sweeps = tokio::spawn({
            let cancel = cancel.clone();
            async move { reaper.run(cancel).await }
        });

        let done = executor.run(execution, &node).await.unwrap().unwrap();
        cancel.cancel();
        sweeps.await.unwrap();

        assert_eq!(done.state, ExecutionState::Completed);
        assert_eq!(store.events().len(), 1);
    }

    #[tokio::test]
    async fn unknown_component_fails_without_running() {
        let (executor, _store, execution, node) = setup("missing").await;
        let done = executor.run(execution, &node).await.unwrap().unwrap();

        assert_eq!(done.state, ExecutionState::Failed);
        assert_eq!(done.error_message.as_deref(), Some("unknown component: missing"));
    }

    #[tokio::test]
    async fn second_run_is_a_duplicate() {
        let (executor, _store, execution, node) = setup("noop").await;
        assert!(executor.run(execution.clone(), &node).await.unwrap().is_some());
        // The stale copy is still pending, but the stored row is not.
        assert!(executor.run(execution, &node).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_requires_active_execution() {
        let (executor, _store, execution, _node) = setup("noop").await;
        assert!(matches!(
            executor.cancel(execution.id).await,
            Err(EngineError::InvalidState {
                state: ExecutionState::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn approval_waits_then_resumes() {
        let (executor, store, execution, node) = setup("approval").await;
        let waiting = executor.run(execution, &node).await.unwrap().unwrap();
        assert_eq!(waiting.state, ExecutionState::Waiting);
        assert!(store.events().is_empty());

        let done = executor
            .handle_action(waiting.id, "reject", json!({"reason": "nope"}))
            .await
            .unwrap();
        assert_eq!(done.state, ExecutionState::Completed);
        let events = store.events();
        assert_eq!(events[0].channel, "rejected");
        assert_eq!(events[0].data["parameters"]["reason"], "nope");

        assert!(matches!(
            executor.handle_action(done.id, "approve", json!({})).await,
            Err(EngineError::InvalidState { .. })
        ));
    }
}
