use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tasksync::channel::{Channel, ChannelHandle, Link, MemoryConnector, Outbound, ReconnectPolicy};
use tasksync::machine::{BehaviorRegistry, StepContext, TaskBehavior};
use tasksync::relay::Relay;
use tasksync::router::CommandRouter;
use tasksync::runtime::{InMemoryReplicaStore, NodeEvent, StartRequest, SyncNode, TaskHandle, TaskView};
use tasksync::sync::diff::Patch;
use tasksync::task::{Command, CommandArgs, Envelope, Task};
use tasksync::{SyncError, SyncResult};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Chat flow shared by the UI node and the processing node.
struct Chat {
    processor: bool,
}

#[async_trait]
impl TaskBehavior for Chat {
    fn name(&self) -> &str {
        "root.chat"
    }

    fn initial_state(&self) -> &str {
        "start"
    }

    fn declares(&self, state: &str) -> bool {
        matches!(state, "start" | "input" | "waiting")
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> Result<Option<String>> {
        let state = ctx.state().map(str::to_string);
        match state.as_deref() {
            Some("start") => Ok(Some("input".to_string())),
            Some("input") => {
                let prompt = ctx.input("promptText").and_then(Value::as_str).unwrap_or("");
                if prompt.is_empty() {
                    return Ok(None);
                }
                ctx.send_update(CommandArgs::default());
                Ok(Some("waiting".to_string()))
            }
            Some("waiting") if self.processor => {
                let busy = ctx.task().command.is_some() || ctx.task().node.command_pending.is_some();
                if busy || ctx.output("text").is_some() {
                    return Ok(None);
                }
                if ctx.holds_lock() {
                    ctx.modify("output.text", json!("Hello"));
                    ctx.send_update(CommandArgs::locking());
                } else if !ctx.is_locked() {
                    ctx.send_update(CommandArgs::locking());
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

/// Starts one child once `input.spawn` is set.
struct Parent;

#[async_trait]
impl TaskBehavior for Parent {
    fn name(&self) -> &str {
        "root.parent"
    }

    fn initial_state(&self) -> &str {
        "start"
    }

    fn declares(&self, state: &str) -> bool {
        matches!(state, "start" | "input" | "waiting")
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> Result<Option<String>> {
        let state = ctx.state().map(str::to_string);
        match state.as_deref() {
            Some("start") => Ok(Some("input".to_string())),
            Some("input") if ctx.input("spawn").is_some() => {
                let mut input = Map::new();
                input.insert("question".to_string(), json!("why"));
                ctx.start_child("root.child", input);
                Ok(Some("waiting".to_string()))
            }
            _ => Ok(None),
        }
    }
}

/// Answers once and finishes.
struct Child;

#[async_trait]
impl TaskBehavior for Child {
    fn name(&self) -> &str {
        "root.child"
    }

    fn initial_state(&self) -> &str {
        "start"
    }

    fn declares(&self, state: &str) -> bool {
        state == "start"
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> Result<Option<String>> {
        if ctx.task().is_done() {
            return Ok(None);
        }
        ctx.modify("output.answer", json!(42));
        ctx.finish();
        ctx.send_update(CommandArgs::default());
        Ok(None)
    }
}

struct TestNode {
    node: Arc<SyncNode>,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    _channel: ChannelHandle,
}

impl TestNode {
    async fn next_event(&mut self, mut predicate: impl FnMut(&NodeEvent) -> bool) -> NodeEvent {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("node event stream open");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("node event in time")
    }
}

fn chat_registry(processor: bool) -> BehaviorRegistry {
    let mut registry = BehaviorRegistry::new();
    registry.register(Arc::new(Chat { processor }));
    registry
}

fn family_registry() -> BehaviorRegistry {
    let mut registry = BehaviorRegistry::new();
    registry.register(Arc::new(Parent));
    registry.register(Arc::new(Child));
    registry
}

fn spawn_node(
    node_id: &str,
    registry: BehaviorRegistry,
) -> (TestNode, mpsc::UnboundedReceiver<Link>) {
    spawn_node_with(node_id, registry, WAIT)
}

fn spawn_node_with(
    node_id: &str,
    registry: BehaviorRegistry,
    mount_timeout: Duration,
) -> (TestNode, mpsc::UnboundedReceiver<Link>) {
    let (connector, links) = MemoryConnector::new();
    let router = Arc::new(CommandRouter::new());
    let (channel, channel_events, _task) = Channel::spawn(
        Arc::new(connector),
        "mem://hub",
        node_id,
        ReconnectPolicy::default(),
        Duration::from_secs(30),
        router.clone(),
    );
    let (node, events) = SyncNode::new(
        node_id,
        router,
        Arc::new(channel.clone()),
        Arc::new(InMemoryReplicaStore::new()),
        registry,
        mount_timeout,
    );
    node.watch_channel(channel_events);
    let test_node = TestNode {
        node,
        events,
        _channel: channel,
    };
    (test_node, links)
}

async fn connect_to(relay: &Arc<Relay>, node_id: &str, registry: BehaviorRegistry) -> TestNode {
    let (mut node, links) = spawn_node(node_id, registry);
    relay.accept(links);
    node.next_event(|e| *e == NodeEvent::Connected).await;
    node.next_event(|e| matches!(e, NodeEvent::Registered(_))).await;
    node
}

async fn wait_view(handle: &TaskHandle, predicate: impl FnMut(&TaskView) -> bool) -> TaskView {
    timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("view in time")
        .expect("instance still mounted")
}

async fn wait_relay(relay: &Relay, instance_id: &str, mut predicate: impl FnMut(&Value) -> bool) -> Value {
    timeout(WAIT, async {
        loop {
            if let Some(doc) = relay.document(instance_id) {
                if predicate(&doc) {
                    return doc;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay document in time")
}

#[tokio::test]
async fn test_start_moves_to_input_without_sending() {
    let relay = Relay::new(Default::default());
    let ui = connect_to(&relay, "node-a", chat_registry(false)).await;

    let handle = ui
        .node
        .start_task(StartRequest::new("root.chat"))
        .await
        .expect("instance started");
    let instance_id = handle.instance_id().to_string();

    let task = handle.task();
    assert_eq!(task.state.current.as_deref(), Some("input"));
    assert_eq!(task.state.last.as_deref(), Some("start"));
    assert!(task.command.is_none());
    assert!(task.node.command_pending.is_none());
    assert_eq!(task.family_id.as_deref(), Some(instance_id.as_str()));

    // Nothing went out, so the relay copy still sits in the initial state
    let doc = relay.document(&instance_id).expect("relay has the instance");
    assert_eq!(doc["state"]["current"], json!("start"));
    assert_eq!(doc["meta"]["founder"], json!("node-a"));
    assert_eq!(ui.node.instances(), vec![instance_id]);
}

#[tokio::test]
async fn test_prompt_lock_and_deferred_write() {
    let relay = Relay::new(Default::default());
    let ui = connect_to(&relay, "node-a", chat_registry(false)).await;
    let worker = connect_to(&relay, "node-b", chat_registry(true)).await;

    let handle = ui
        .node
        .start_task(StartRequest::new("root.chat"))
        .await
        .expect("instance started");
    let instance_id = handle.instance_id().to_string();
    let worker_handle = worker.node.join_task(&instance_id).await.expect("joined");
    assert_eq!(worker_handle.task().state.current.as_deref(), Some("input"));

    // The user submits a prompt
    ui.node
        .modify(&instance_id, Patch::new().set("input.promptText", json!("hi")))
        .expect("modify");

    let doc = wait_relay(&relay, &instance_id, |d| d["input"]["promptText"] == json!("hi")).await;
    assert_eq!(doc["state"]["current"], json!("waiting"));

    // The worker takes the lock and answers under it
    let view = wait_view(&handle, |v| v.task.output.get("text") == Some(&json!("Hello"))).await;
    assert_eq!(view.task.meta.locked.as_deref(), Some("node-b"));
    assert_eq!(view.task.state.current.as_deref(), Some("waiting"));

    // A write from the UI node waits for the lock
    ui.node
        .modify(
            &instance_id,
            Patch::new()
                .set("output.note", json!("mine"))
                .set("command", json!("update")),
        )
        .expect("modify");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.task().command, Some(Command::Update));
    let doc = relay.document(&instance_id).expect("doc");
    assert!(doc["output"].get("note").is_none());
    assert_eq!(doc["meta"]["locked"], json!("node-b"));

    // Releasing the lock lets the deferred write through
    worker
        .node
        .modify(
            &instance_id,
            Patch::new()
                .set("command", json!("update"))
                .set("commandArgs", json!({ "unlock": true })),
        )
        .expect("release");

    let doc = wait_relay(&relay, &instance_id, |d| d["output"]["note"] == json!("mine")).await;
    assert!(doc["meta"].get("locked").is_none());
    assert_eq!(doc["output"]["text"], json!("Hello"));
    let view = wait_view(&handle, |v| v.task.command.is_none()).await;
    assert_eq!(view.task.meta.locked, None);
}

#[tokio::test]
async fn test_undeclared_state_fails_the_instance() {
    let relay = Relay::new(Default::default());
    let mut ui = connect_to(&relay, "node-a", chat_registry(false)).await;

    let handle = ui
        .node
        .start_task(StartRequest::new("root.chat"))
        .await
        .expect("instance started");
    let instance_id = handle.instance_id().to_string();

    ui.node.set_state(&instance_id, "nowhere").expect("event queued");
    match ui.next_event(|e| matches!(e, NodeEvent::InstanceFailed { .. })).await {
        NodeEvent::InstanceFailed { instance_id: failed, error } => {
            assert_eq!(failed, instance_id);
            assert!(error.contains("nowhere"), "unexpected error text: {}", error);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(ui.node.handle(&instance_id).is_none());
    assert!(matches!(
        ui.node.set_state(&instance_id, "input"),
        Err(SyncError::NotMounted(_))
    ));
}

#[tokio::test]
async fn test_unknown_definition_is_not_mounted() {
    let relay = Relay::new(Default::default());
    let ui = connect_to(&relay, "node-a", chat_registry(false)).await;

    let err = ui
        .node
        .start_task(StartRequest::new("root.unknown"))
        .await
        .expect_err("no behavior for root.unknown");
    assert!(matches!(err, SyncError::UnknownBehavior(id) if id == "root.unknown"));
    assert!(ui.node.instances().is_empty());
}

#[tokio::test]
async fn test_joining_an_unknown_instance_fails() {
    let relay = Relay::new(Default::default());
    let ui = connect_to(&relay, "node-a", chat_registry(false)).await;

    let err = ui.node.join_task("missing").await.expect_err("relay refuses");
    match err {
        SyncError::RemoteTask(message) => assert_eq!(message, "unknown instance"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_child_runs_in_the_parent_family() {
    let relay = Relay::new(Default::default());
    let mut node = connect_to(&relay, "node-a", family_registry()).await;

    let parent = node
        .node
        .start_task(StartRequest::new("root.parent"))
        .await
        .expect("parent started");
    let parent_id = parent.instance_id().to_string();

    node.node
        .modify(&parent_id, Patch::new().set("input.spawn", json!(true)))
        .expect("modify");

    let child_id = match node
        .next_event(|e| matches!(e, NodeEvent::Completed { instance_id } if *instance_id != parent_id))
        .await
    {
        NodeEvent::Completed { instance_id } => instance_id,
        other => panic!("unexpected event {:?}", other),
    };

    let view = wait_view(&parent, |v| !v.task.meta.children_id.is_empty()).await;
    assert_eq!(view.task.meta.children_id, vec![child_id.clone()]);
    assert_eq!(view.task.state.current.as_deref(), Some("waiting"));

    let child = relay.document(&child_id).expect("child on relay");
    assert_eq!(child["familyId"], json!(parent_id));
    assert_eq!(child["meta"]["parentInstanceId"], json!(parent_id));
    assert_eq!(child["input"]["question"], json!("why"));
    assert_eq!(child["output"]["answer"], json!(42));
    assert_eq!(child["state"]["done"], json!(true));

    // Completed instances are dropped locally
    assert!(node.node.handle(&child_id).is_none());
    assert_eq!(node.node.instances(), vec![parent_id]);
}

/// Drives a node by hand from the hub side of its link.
struct FakeHub {
    link: Link,
}

impl FakeHub {
    async fn expect(&mut self, command: Command) -> Value {
        timeout(WAIT, async {
            loop {
                let raw = self.link.incoming.recv().await.expect("node link open");
                let envelope = Envelope::decode(&raw).expect("valid frame");
                if envelope.command() == Some(command) {
                    return envelope.task;
                }
            }
        })
        .await
        .expect("frame in time")
    }

    fn send(&self, command: Command, task: Value) {
        let mut envelope = Envelope::new(task);
        envelope.stamp(command, None);
        self.link
            .outgoing
            .send(envelope.encode().expect("encode"))
            .expect("node listening");
    }
}

#[tokio::test]
async fn test_remote_error_clears_pending_update() {
    let (mut ui, mut links) = spawn_node("node-a", chat_registry(false));
    let mut hub = FakeHub {
        link: timeout(WAIT, links.recv()).await.expect("link in time").expect("link"),
    };
    ui.next_event(|e| *e == NodeEvent::Connected).await;
    let register = hub.expect(Command::Register).await;
    assert_eq!(register["nodeId"], json!("node-a"));

    let node = ui.node.clone();
    let starting = tokio::spawn(async move { node.start_task(StartRequest::new("root.chat")).await });
    let start = hub.expect(Command::Start).await;
    assert_eq!(start["node"]["commandArgs"]["id"], json!("root.chat"));
    let correlation = start["node"]["commandArgs"]["prevInstanceId"].clone();
    hub.send(
        Command::Init,
        json!({
            "id": "root.chat",
            "instanceId": "t1",
            "state": { "current": "start" },
            "meta": { "prevInstanceId": correlation },
        }),
    );
    let handle = starting.await.expect("join").expect("mounted");

    ui.node
        .modify("t1", Patch::new().set("input.promptText", json!("hi")))
        .expect("modify");
    let update = hub.expect(Command::Update).await;
    assert_eq!(update["input"]["promptText"], json!("hi"));
    assert_eq!(update["node"]["id"], json!("node-a"));
    wait_view(&handle, |v| v.task.node.command_pending == Some(Command::Update)).await;

    hub.send(Command::Error, json!({ "instanceId": "t1", "error": "Task locked" }));
    let event = ui.next_event(|e| matches!(e, NodeEvent::RemoteError { .. })).await;
    assert_eq!(
        event,
        NodeEvent::RemoteError {
            instance_id: Some("t1".to_string()),
            message: "Task locked".to_string(),
        }
    );
    let view = wait_view(&handle, |v| v.task.node.command_pending.is_none()).await;
    assert_eq!(view.task.state.current.as_deref(), Some("waiting"));

    // Errors and logins nobody claims surface on the node
    hub.send(Command::Error, json!({ "error": "hub restarting" }));
    let event = ui.next_event(|e| matches!(e, NodeEvent::RemoteError { .. })).await;
    assert_eq!(
        event,
        NodeEvent::RemoteError {
            instance_id: None,
            message: "hub restarting".to_string(),
        }
    );
    hub.send(Command::Login, json!({ "user": { "name": "ada" } }));
    let event = ui.next_event(|e| matches!(e, NodeEvent::Login(_))).await;
    assert_eq!(event, NodeEvent::Login(json!({ "name": "ada" })));
}

impl FakeHub {
    /// Answers the node's `start` with `init`, filling in the correlation.
    async fn mount(&mut self, node: &Arc<SyncNode>, mut init: Value) -> TaskHandle {
        let definition = init["id"].as_str().expect("definition id").to_string();
        let node = node.clone();
        let starting = tokio::spawn(async move { node.start_task(StartRequest::new(definition)).await });
        let start = self.expect(Command::Start).await;
        init["meta"]["prevInstanceId"] = start["node"]["commandArgs"]["prevInstanceId"].clone();
        self.send(Command::Init, init);
        starting.await.expect("join").expect("mounted")
    }
}

async fn hub_node(node_id: &str, registry: BehaviorRegistry, mount_timeout: Duration) -> (TestNode, FakeHub) {
    let (mut node, mut links) = spawn_node_with(node_id, registry, mount_timeout);
    let mut hub = FakeHub {
        link: timeout(WAIT, links.recv()).await.expect("link in time").expect("link"),
    };
    node.next_event(|e| *e == NodeEvent::Connected).await;
    hub.expect(Command::Register).await;
    (node, hub)
}

/// Always restarts from `start`, wherever the replica left off.
struct Resetting;

#[async_trait]
impl TaskBehavior for Resetting {
    fn name(&self) -> &str {
        "root.reset"
    }

    fn initial_state(&self) -> &str {
        "start"
    }

    fn declares(&self, state: &str) -> bool {
        matches!(state, "start" | "input")
    }

    fn reset_on_mount(&self) -> bool {
        true
    }

    async fn step(&self, _ctx: &mut StepContext<'_>) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Never finishes its first step.
struct Stuck;

#[async_trait]
impl TaskBehavior for Stuck {
    fn name(&self) -> &str {
        "root.stuck"
    }

    fn initial_state(&self) -> &str {
        "start"
    }

    fn declares(&self, state: &str) -> bool {
        state == "start"
    }

    async fn step(&self, _ctx: &mut StepContext<'_>) -> Result<Option<String>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(None)
    }
}

#[tokio::test]
async fn test_command_change_while_one_is_queued_fails_the_instance() {
    let (mut ui, mut hub) = hub_node("node-a", chat_registry(false), WAIT).await;
    let handle = hub
        .mount(&ui.node, json!({ "id": "root.chat", "instanceId": "t1", "state": { "current": "start" } }))
        .await;

    // Another node holds the lock, so a queued update stays queued
    hub.send(
        Command::Update,
        json!({
            "instanceId": "t1",
            "meta": { "locked": "node-z", "messageId": 1 },
            "node": { "command": "update", "sourceNodeId": "node-z" },
        }),
    );
    wait_view(&handle, |v| v.task.meta.locked.as_deref() == Some("node-z")).await;

    ui.node
        .modify(
            "t1",
            Patch::new()
                .set("output.note", json!("mine"))
                .set("command", json!("update")),
        )
        .expect("modify");
    wait_view(&handle, |v| v.task.command == Some(Command::Update)).await;

    ui.node
        .modify("t1", Patch::new().set("command", json!("partial")))
        .expect("event queued");
    match ui.next_event(|e| matches!(e, NodeEvent::InstanceFailed { .. })).await {
        NodeEvent::InstanceFailed { instance_id, error } => {
            assert_eq!(instance_id, "t1");
            assert!(error.contains("update -> partial"), "unexpected error text: {}", error);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(ui.node.handle("t1").is_none());
}

#[tokio::test]
async fn test_family_diffs_are_published_locally() {
    let (ui, mut hub) = hub_node("node-a", chat_registry(false), WAIT).await;
    hub.mount(
        &ui.node,
        json!({
            "id": "root.chat",
            "instanceId": "t1",
            "familyId": "f1",
            "state": { "current": "start" },
            "config": { "familyTaskDiff": true },
        }),
    )
    .await;
    let mut family = ui.node.family().subscribe("f1");

    ui.node
        .modify("t1", Patch::new().set("input.promptText", json!("hi")))
        .expect("modify");
    let update = hub.expect(Command::Update).await;
    assert_eq!(update["familyId"], json!("f1"));

    let published = timeout(WAIT, family.recv()).await.expect("diff in time").expect("diff");
    assert_eq!(published.family_id, "f1");
    assert_eq!(published.instance_id, "t1");
    assert!(published.patch.touches("input.promptText"));
    assert!(published.patch.touches("state.current"));
}

#[tokio::test]
async fn test_reset_on_mount_restarts_from_the_initial_state() {
    let mut registry = chat_registry(false);
    registry.register(Arc::new(Resetting));
    let (ui, mut hub) = hub_node("node-a", registry, WAIT).await;

    let reset = hub
        .mount(&ui.node, json!({ "id": "root.reset", "instanceId": "t1", "state": { "current": "input" } }))
        .await;
    assert_eq!(reset.task().state.current.as_deref(), Some("start"));

    // Behaviors without the flag resume where the replica left off
    let chat = hub
        .mount(&ui.node, json!({ "id": "root.chat", "instanceId": "t2", "state": { "current": "waiting" } }))
        .await;
    assert_eq!(chat.task().state.current.as_deref(), Some("waiting"));
}

#[tokio::test]
async fn test_start_times_out_when_the_hub_stays_silent() {
    let (ui, mut hub) = hub_node("node-a", chat_registry(false), Duration::from_millis(200)).await;

    let node = ui.node.clone();
    let starting = tokio::spawn(async move { node.start_task(StartRequest::new("root.chat")).await });
    hub.expect(Command::Start).await;
    let err = starting.await.expect("join").expect_err("no reply");
    assert!(matches!(err, SyncError::MountTimeout { .. }), "unexpected error {:?}", err);
    assert!(ui.node.instances().is_empty());
}

#[tokio::test]
async fn test_slow_first_step_times_out_and_unmounts() {
    let mut registry = BehaviorRegistry::new();
    registry.register(Arc::new(Stuck));
    let (ui, mut hub) = hub_node("node-a", registry, Duration::from_millis(200)).await;

    let node = ui.node.clone();
    let starting = tokio::spawn(async move { node.start_task(StartRequest::new("root.stuck")).await });
    let start = hub.expect(Command::Start).await;
    hub.send(
        Command::Init,
        json!({
            "id": "root.stuck",
            "instanceId": "t1",
            "meta": { "prevInstanceId": start["node"]["commandArgs"]["prevInstanceId"].clone() },
        }),
    );
    let err = starting.await.expect("join").expect_err("first step never finishes");
    match err {
        SyncError::MountTimeout { instance_id, timeout } => {
            assert_eq!(instance_id, "t1");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(ui.node.handle("t1").is_none());
    assert!(ui.node.instances().is_empty());
}

#[tokio::test]
async fn test_hub_reload_rejoins_mounted_instances() {
    let (mut ui, mut hub) = hub_node("node-a", chat_registry(false), WAIT).await;
    hub.mount(&ui.node, json!({ "id": "root.chat", "instanceId": "t1", "state": { "current": "start" } }))
        .await;

    hub.send(Command::Reload, json!({}));
    let start = hub.expect(Command::Start).await;
    assert_eq!(start["node"]["commandArgs"]["instanceId"], json!("t1"));
    let correlation = start["node"]["commandArgs"]["prevInstanceId"].clone();
    assert!(correlation.is_string());
    hub.send(
        Command::Join,
        json!({
            "id": "root.chat",
            "instanceId": "t1",
            "state": { "current": "waiting" },
            "input": { "promptText": "restored" },
            "meta": { "prevInstanceId": correlation },
        }),
    );

    let event = ui.next_event(|e| matches!(e, NodeEvent::Reloaded { .. })).await;
    assert_eq!(event, NodeEvent::Reloaded { rejoined: 1 });
    let handle = ui.node.handle("t1").expect("mounted again");
    let task = handle.task();
    assert_eq!(task.state.current.as_deref(), Some("waiting"));
    assert_eq!(task.input.get("promptText"), Some(&json!("restored")));
    let stored = ui.node.store().get("t1").await.expect("store").expect("replica");
    assert_eq!(stored["input"]["promptText"], json!("restored"));
}

/// Records every command instead of sending it.
#[derive(Default)]
struct RecordingOutbound {
    sent: parking_lot::Mutex<Vec<Command>>,
}

impl Outbound for RecordingOutbound {
    fn send(&self, command: Command, _task: Value) -> SyncResult<u64> {
        let mut sent = self.sent.lock();
        sent.push(command);
        Ok(sent.len() as u64)
    }
}

#[tokio::test]
async fn test_repeated_wakeups_send_an_update_once() {
    let outbound = Arc::new(RecordingOutbound::default());
    let (node, _events) = SyncNode::new(
        "node-a",
        Arc::new(CommandRouter::new()),
        outbound.clone(),
        Arc::new(InMemoryReplicaStore::new()),
        chat_registry(false),
        WAIT,
    );
    let task = Task::from_value(json!({
        "id": "root.chat",
        "instanceId": "t1",
        "state": { "current": "input" },
        "input": { "promptText": "hi" },
    }))
    .expect("task");
    let handle = node.mount(task).await.expect("mounted");
    assert_eq!(*outbound.sent.lock(), vec![Command::Update]);
    assert_eq!(handle.task().node.command_pending, Some(Command::Update));

    handle.tick().expect("tick");
    handle.tick().expect("tick");
    node.modify("t1", Patch::new().set("input.seen", json!(1)))
        .expect("modify");
    wait_view(&handle, |v| v.task.input.get("seen") == Some(&json!(1))).await;
    assert_eq!(*outbound.sent.lock(), vec![Command::Update]);

    // A second update waits for the first to be confirmed
    node.modify(
        "t1",
        Patch::new()
            .set("input.extra", json!(true))
            .set("command", json!("update")),
    )
    .expect("modify");
    let view = wait_view(&handle, |v| v.task.command == Some(Command::Update)).await;
    assert_eq!(view.task.node.command_pending, Some(Command::Update));
    assert_eq!(*outbound.sent.lock(), vec![Command::Update]);
}

/// Accepts links for `relay` through a forwarder that drops every open
/// connection when the returned sender fires.
fn accept_cuttable(relay: &Arc<Relay>, mut links: mpsc::UnboundedReceiver<Link>) -> broadcast::Sender<()> {
    let (cut, _) = broadcast::channel(4);
    let relay = relay.clone();
    let cuts = cut.clone();
    tokio::spawn(async move {
        while let Some(node_side) = links.recv().await {
            let (relay_side, proxy) = Link::pair();
            relay.attach(relay_side);
            let mut cut_rx = cuts.subscribe();
            tokio::spawn(async move {
                let Link { outgoing: to_node, incoming: mut from_node } = node_side;
                let Link { outgoing: to_relay, incoming: mut from_relay } = proxy;
                loop {
                    tokio::select! {
                        frame = from_node.recv() => match frame {
                            Some(frame) => {
                                let _ = to_relay.send(frame);
                            }
                            None => break,
                        },
                        frame = from_relay.recv() => match frame {
                            Some(frame) => {
                                let _ = to_node.send(frame);
                            }
                            None => break,
                        },
                        _ = cut_rx.recv() => break,
                    }
                }
            });
        }
    });
    cut
}

#[tokio::test]
async fn test_reconnected_node_keeps_receiving_updates() {
    let relay = Relay::new(Default::default());
    let ui = connect_to(&relay, "node-a", chat_registry(false)).await;
    let (mut peer, links) = spawn_node("node-b", chat_registry(false));
    let cut = accept_cuttable(&relay, links);
    peer.next_event(|e| *e == NodeEvent::Connected).await;
    peer.next_event(|e| matches!(e, NodeEvent::Registered(_))).await;

    let handle = ui
        .node
        .start_task(StartRequest::new("root.chat"))
        .await
        .expect("instance started");
    let instance_id = handle.instance_id().to_string();
    let peer_handle = peer.node.join_task(&instance_id).await.expect("joined");
    assert_eq!(relay.member_count(&instance_id), 2);

    cut.send(()).expect("open connection");
    peer.next_event(|e| *e == NodeEvent::Disconnected).await;
    peer.next_event(|e| *e == NodeEvent::Connected).await;
    timeout(WAIT, async {
        while relay.member_count(&instance_id) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer back in the instance");

    ui.node
        .modify(&instance_id, Patch::new().set("input.promptText", json!("hi")))
        .expect("modify");
    let view = wait_view(&peer_handle, |v| v.task.input.get("promptText") == Some(&json!("hi"))).await;
    assert_eq!(view.task.state.current.as_deref(), Some("waiting"));
    assert_eq!(peer.node.instances(), vec![instance_id]);
}
