//! End-to-end tests for conveyor-engine over the in-memory store and transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::{NodeId, OrganizationId, QueueItemId};
use conveyor_engine::{
    Component, ComponentError, Configuration, EngineError, Event, EventState, EventStore,
    ExecutionContext, ExecutionState, ExecutionStore, Handled, MemoryStore, MemoryTransport,
    Processing, QueueItem, Registry, Router, RouterConfig, Worker,
};
use conveyor_workflow::{Edge, Filter, Node, Predicate, Workflow};
use serde_json::{Value as JsonValue, json};

/// Emits its input on `passed` when `ok` is true, otherwise on `failed`.
struct Gate;

#[async_trait]
impl Component for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn output_channels(&self, _config: &Configuration) -> Vec<String> {
        vec!["passed".to_string(), "failed".to_string()]
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        let channel = if ctx.input()["ok"] == json!(true) {
            "passed"
        } else {
            "failed"
        };
        let payload = json!({"checked": ctx.input().clone()});
        ctx.emit(channel, &format!("gate.{channel}"), vec![payload])
    }
}

/// Always fails the way an unreachable upstream API would.
struct Broken;

#[async_trait]
impl Component for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        Err(ComponentError::failed("upstream returned 503"))
    }
}

/// Counts invocations and takes a little while to finish.
struct Counting {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Component for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let input = ctx.input().clone();
        ctx.emit("default", "counted", vec![input])
    }
}

/// Waits forever and fails its cancel hook.
struct Stubborn;

#[async_trait]
impl Component for Stubborn {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn process_queue_item(
        &self,
        _ctx: &ExecutionContext,
    ) -> Result<Processing, ComponentError> {
        Ok(Processing::Await)
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn cancel(&self, _ctx: &ExecutionContext) -> Result<(), ComponentError> {
        Err(ComponentError::failed("remote job could not be stopped"))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    router: Router<MemoryStore, MemoryTransport>,
    worker: Arc<Worker<MemoryStore, MemoryTransport>>,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::with_builtins()
            .with_component(Gate)
            .with_component(Broken)
            .with_component(Stubborn)
            .with_component(Counting {
                calls: Arc::clone(&calls),
            });
        let registry = Arc::new(registry);

        Self {
            router: Router::new(
                Arc::clone(&store),
                Arc::clone(&transport),
                RouterConfig::default(),
            ),
            worker: Arc::new(Worker::new(Arc::clone(&store), transport, registry)),
            store,
            calls,
        }
    }

    async fn fire(&self, workflow: &Workflow, trigger: NodeId, data: JsonValue) -> Event {
        let event = Event::root(workflow.id, trigger, "default", "manual", data);
        self.store.create_event(&event).await.unwrap();
        event
    }

    /// Routes and handles until nothing is left to do.
    async fn drain(&self) {
        for _ in 0..10 {
            let summary = self.router.route_once().await.unwrap();
            let handled: HashSet<QueueItemId> = self
                .store
                .executions()
                .iter()
                .map(|e| e.queue_item_id)
                .collect();
            let unhandled: Vec<QueueItem> = self
                .store
                .queue_items()
                .into_iter()
                .filter(|item| !handled.contains(&item.id))
                .collect();
            if summary.claimed == 0 && unhandled.is_empty() {
                return;
            }
            for item in unhandled {
                self.worker.handle(&item).await.unwrap();
            }
        }
        panic!("workflow did not settle");
    }
}

/// Trigger T -> A (`gate`) -> B (`noop`, listening on `passed` only).
fn gated_workflow(first: &str) -> (Workflow, NodeId, NodeId, NodeId) {
    let mut workflow = Workflow::new(OrganizationId::new(), "gated");
    let t = workflow
        .graph
        .add_node(Node::trigger("T", "manual"))
        .unwrap();
    let a = workflow.graph.add_node(Node::component("A", first)).unwrap();
    let b = workflow.graph.add_node(Node::component("B", "noop")).unwrap();
    workflow.graph.add_edge(t, a, Edge::default()).unwrap();
    workflow
        .graph
        .add_edge(a, b, Edge::on_channel("passed"))
        .unwrap();
    (workflow, t, a, b)
}

fn fan_out(targets: usize) -> (Workflow, NodeId) {
    let mut workflow = Workflow::new(OrganizationId::new(), "fan out");
    let t = workflow
        .graph
        .add_node(Node::trigger("T", "manual"))
        .unwrap();
    for i in 0..targets {
        let node = workflow
            .graph
            .add_node(Node::component(format!("step-{i}"), "noop"))
            .unwrap();
        workflow.graph.add_edge(t, node, Edge::default()).unwrap();
    }
    (workflow, t)
}

#[tokio::test]
async fn retried_routing_never_duplicates_queue_items() {
    let harness = Harness::new();
    let (workflow, t) = fan_out(3);
    harness.store.insert_workflow(workflow.clone());
    let event = harness.fire(&workflow, t, json!({})).await;

    harness.router.route_once().await.unwrap();
    assert_eq!(harness.store.queue_items().len(), 3);

    // A retry after a crash recomputes the same targets with fresh IDs.
    let retry = workflow
        .graph
        .downstream(t, "default", &event.data)
        .unwrap()
        .into_iter()
        .map(|node_id| QueueItem::for_event(&event, node_id))
        .collect();
    let items = harness.store.route_event(event.id, retry).await.unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(harness.store.queue_items().len(), 3);

    assert_eq!(harness.router.route_once().await.unwrap().claimed, 0);
    assert_eq!(harness.store.queue_items().len(), 3);
}

#[tokio::test]
async fn interrupted_routing_is_completed_once() {
    let harness = Harness::new();
    let (workflow, t) = fan_out(3);
    harness.store.insert_workflow(workflow.clone());
    let event = harness.fire(&workflow, t, json!({})).await;

    let first = workflow.graph.downstream(t, "default", &event.data).unwrap()[0];
    harness
        .store
        .insert_queue_items(vec![QueueItem::for_event(&event, first)]);
    assert!(harness.store.events()[0].is_pending());

    let summary = harness.router.route_once().await.unwrap();
    assert_eq!(summary.routed, 1);
    assert_eq!(harness.store.queue_items().len(), 3);
    assert_eq!(harness.store.events()[0].state, EventState::Routed);

    assert_eq!(harness.router.route_once().await.unwrap().claimed, 0);
    assert_eq!(harness.store.queue_items().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_execute_once() {
    let harness = Harness::new();
    let mut workflow = Workflow::new(OrganizationId::new(), "race");
    let t = workflow
        .graph
        .add_node(Node::trigger("T", "manual"))
        .unwrap();
    let step = workflow
        .graph
        .add_node(Node::component("step", "counting"))
        .unwrap();
    workflow.graph.add_edge(t, step, Edge::default()).unwrap();
    harness.store.insert_workflow(workflow.clone());
    harness.fire(&workflow, t, json!({"n": 1})).await;
    harness.router.route_once().await.unwrap();

    let item = harness.store.queue_items().remove(0);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let worker = Arc::clone(&harness.worker);
            let item = item.clone();
            tokio::spawn(async move { worker.handle(&item).await })
        })
        .collect();

    let mut executed = 0;
    for handle in handles {
        if let Handled::Executed(_) = handle.await.unwrap().unwrap() {
            executed += 1;
        }
    }

    assert_eq!(executed, 1);
    assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.store.executions().len(), 1);
}

#[tokio::test]
async fn terminal_executions_reject_writes() {
    let harness = Harness::new();
    let (workflow, t) = fan_out(1);
    harness.store.insert_workflow(workflow.clone());
    harness.fire(&workflow, t, json!({})).await;
    harness.drain().await;

    let done = harness.store.executions().remove(0);
    assert_eq!(done.state, ExecutionState::Completed);

    let mut rewritten = done.clone();
    rewritten.state = ExecutionState::Failed;
    for expected in [
        ExecutionState::Pending,
        ExecutionState::Running,
        ExecutionState::Waiting,
    ] {
        assert!(
            !harness
                .store
                .transition_execution(&rewritten, expected)
                .await
                .unwrap()
        );
    }

    let executor = conveyor_engine::NodeExecutor::new(
        Arc::clone(&harness.store),
        Arc::new(Registry::with_builtins()),
    );
    assert!(matches!(
        executor.cancel(done.id).await,
        Err(EngineError::InvalidState {
            state: ExecutionState::Completed,
            ..
        })
    ));

    let item = harness.store.queue_items().remove(0);
    assert_eq!(harness.worker.handle(&item).await.unwrap(), Handled::Duplicate);
    assert_eq!(harness.store.executions()[0], done);
}

#[tokio::test]
async fn predicates_pick_the_matching_edge() {
    let harness = Harness::new();
    let mut workflow = Workflow::new(OrganizationId::new(), "predicates");
    let t = workflow
        .graph
        .add_node(Node::trigger("T", "manual"))
        .unwrap();
    let on_pass = workflow
        .graph
        .add_node(Node::component("pass", "noop"))
        .unwrap();
    let on_fail = workflow
        .graph
        .add_node(Node::component("fail", "noop"))
        .unwrap();
    workflow
        .graph
        .add_edge(
            t,
            on_pass,
            Edge::default().with_filter(Filter::new(vec![Predicate::equals("passed")])),
        )
        .unwrap();
    workflow
        .graph
        .add_edge(
            t,
            on_fail,
            Edge::default().with_filter(Filter::new(vec![Predicate::matches("^fail.*")])),
        )
        .unwrap();
    harness.store.insert_workflow(workflow.clone());

    harness.fire(&workflow, t, json!("passed")).await;
    harness.router.route_once().await.unwrap();
    let targets: Vec<NodeId> = harness
        .store
        .queue_items()
        .iter()
        .map(|i| i.node_id)
        .collect();
    assert_eq!(targets, vec![on_pass]);

    harness.fire(&workflow, t, json!("failed-timeout")).await;
    harness.router.route_once().await.unwrap();
    let targets: Vec<NodeId> = harness
        .store
        .queue_items()
        .iter()
        .map(|i| i.node_id)
        .collect();
    assert_eq!(targets, vec![on_pass, on_fail]);
}

#[tokio::test]
async fn passed_output_flows_to_listener() {
    let harness = Harness::new();
    let (workflow, t, a, b) = gated_workflow("gate");
    harness.store.insert_workflow(workflow.clone());
    let trigger_event = harness.fire(&workflow, t, json!({"ok": true})).await;

    harness.drain().await;

    let executions = harness.store.executions();
    assert_eq!(executions.len(), 2);
    let exec_a = executions.iter().find(|e| e.node_id == a).unwrap();
    let exec_b = executions.iter().find(|e| e.node_id == b).unwrap();
    let passed = &exec_a.output_data.as_ref().unwrap()["passed"];
    assert_eq!(exec_b.input_data, passed[0]);
    assert_eq!(exec_b.root_event_id, trigger_event.id);
    assert_eq!(exec_b.state, ExecutionState::Completed);
}

#[tokio::test]
async fn failed_channel_has_no_listener() {
    let harness = Harness::new();
    let (workflow, t, a, _) = gated_workflow("gate");
    harness.store.insert_workflow(workflow.clone());
    harness.fire(&workflow, t, json!({"ok": false})).await;

    harness.drain().await;

    let executions = harness.store.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].node_id, a);
    let events = harness.store.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].channel, "failed");
    assert_eq!(events[1].state, EventState::Routed);
}

#[tokio::test]
async fn execute_error_stops_the_branch() {
    let harness = Harness::new();
    let (workflow, t, a, b) = gated_workflow("broken");
    harness.store.insert_workflow(workflow.clone());
    harness.fire(&workflow, t, json!({"ok": true})).await;

    harness.drain().await;

    let executions = harness.store.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].node_id, a);
    assert_eq!(executions[0].state, ExecutionState::Failed);
    assert_eq!(
        executions[0].error_message.as_deref(),
        Some("upstream returned 503")
    );
    assert_eq!(harness.store.events().len(), 1);
    assert!(harness.store.queue_items().iter().all(|i| i.node_id != b));
}

#[tokio::test]
async fn second_claim_is_a_noop() {
    let harness = Harness::new();
    let (workflow, t) = fan_out(1);
    harness.store.insert_workflow(workflow.clone());
    harness.fire(&workflow, t, json!({})).await;
    harness.router.route_once().await.unwrap();
    let item = harness.store.queue_items().remove(0);

    let first = harness.worker.handle(&item).await.unwrap();
    let second = harness.worker.handle(&item).await.unwrap();

    assert!(matches!(first, Handled::Executed(_)));
    assert_eq!(second, Handled::Duplicate);
    assert_eq!(harness.store.executions().len(), 1);
}

#[tokio::test]
async fn cancel_reaches_canceled_when_hook_fails() {
    let harness = Harness::new();
    let (workflow, t) = {
        let mut workflow = Workflow::new(OrganizationId::new(), "cancel");
        let t = workflow
            .graph
            .add_node(Node::trigger("T", "manual"))
            .unwrap();
        let step = workflow
            .graph
            .add_node(Node::component("step", "stubborn"))
            .unwrap();
        workflow.graph.add_edge(t, step, Edge::default()).unwrap();
        (workflow, t)
    };
    harness.store.insert_workflow(workflow.clone());
    harness.fire(&workflow, t, json!({})).await;
    harness.drain().await;

    let waiting = harness.store.executions().remove(0);
    assert_eq!(waiting.state, ExecutionState::Waiting);

    let registry = Registry::new().with_component(Stubborn);
    let executor =
        conveyor_engine::NodeExecutor::new(Arc::clone(&harness.store), Arc::new(registry));
    let canceled = executor.cancel(waiting.id).await.unwrap();
    assert_eq!(canceled.state, ExecutionState::Canceled);
    assert_eq!(
        harness.store.find_execution(waiting.id).await.unwrap().unwrap().state,
        ExecutionState::Canceled
    );
}

#[tokio::test]
async fn approval_resumes_through_chosen_channel() {
    let harness = Harness::new();
    let mut workflow = Workflow::new(OrganizationId::new(), "approval");
    let t = workflow
        .graph
        .add_node(Node::trigger("T", "manual"))
        .unwrap();
    let gate = workflow
        .graph
        .add_node(Node::component("review", "approval"))
        .unwrap();
    let ship = workflow
        .graph
        .add_node(Node::component("ship", "noop"))
        .unwrap();
    workflow.graph.add_edge(t, gate, Edge::default()).unwrap();
    workflow
        .graph
        .add_edge(gate, ship, Edge::on_channel("approved"))
        .unwrap();
    harness.store.insert_workflow(workflow.clone());
    harness.fire(&workflow, t, json!({"release": "1.2.0"})).await;
    harness.drain().await;

    let waiting = harness.store.executions().remove(0);
    assert_eq!(waiting.state, ExecutionState::Waiting);

    let executor = conveyor_engine::NodeExecutor::new(
        Arc::clone(&harness.store),
        Arc::new(Registry::with_builtins()),
    );
    let approved = executor
        .handle_action(waiting.id, "approve", json!({"by": "ops"}))
        .await
        .unwrap();
    assert_eq!(approved.state, ExecutionState::Completed);

    harness.drain().await;
    let shipped = harness
        .store
        .executions()
        .into_iter()
        .find(|e| e.node_id == ship)
        .unwrap();
    assert_eq!(shipped.state, ExecutionState::Completed);
    assert_eq!(shipped.input_data["input"]["release"], "1.2.0");
    assert_eq!(shipped.input_data["parameters"]["by"], "ops");
}
