use std::sync::{Arc, Weak};
use std::time::Duration;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::channel::{ChannelEvent, Outbound};
use crate::error::{SyncError, SyncResult};
use crate::family::FamilyBroadcaster;
use crate::machine::BehaviorRegistry;
use crate::router::{CommandRouter, MessageFilter, Subscription};
use crate::runtime::actor::{ActorContext, SpawnRequest, TaskActor, TaskEvent, TaskHandle};
use crate::runtime::storage::ReplicaStore;
use crate::sync::diff::Patch;
use crate::sync::reconcile::Reconciler;
use crate::task::{lookup, set_path, Command, CommandArgs, InboundMessage, Task};

/// What a node reports to its embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Connected,
    Disconnected,
    /// The hub came back after reconnects ran out; every mounted instance
    /// was dropped and rejoined.
    Reloaded { rejoined: usize },
    /// Reconnects and probes are exhausted.
    GaveUp,
    Registered(Value),
    Login(Value),
    Mounted { instance_id: String },
    RemoteError { instance_id: Option<String>, message: String },
    InstanceFailed { instance_id: String, error: String },
    Completed { instance_id: String },
    SendFailed { instance_id: String, error: String },
    ChildFailed { parent_instance_id: String, error: String },
}

/// Parameters of a `start` command.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Definition id, e.g. `root.chat`.
    pub id: String,
    pub input: Map<String, Value>,
    /// Correlation id for the reply; generated when absent.
    pub prev_instance_id: Option<String>,
    pub parent_instance_id: Option<String>,
}

impl StartRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_parent(mut self, parent_instance_id: impl Into<String>) -> Self {
        self.parent_instance_id = Some(parent_instance_id.into());
        self
    }
}

/// 同步节点 (Sync Node)
/// Owns the mounted task actors of one process and the plumbing between
/// them: router subscriptions, replica store, reconciler and outbound channel.
pub struct SyncNode {
    node_id: String,
    router: Arc<CommandRouter>,
    outbound: Arc<dyn Outbound>,
    reconciler: Arc<Reconciler>,
    registry: BehaviorRegistry,
    family: FamilyBroadcaster,
    actors: DashMap<String, TaskHandle>,
    internal: mpsc::UnboundedSender<NodeEvent>,
    spawner: mpsc::UnboundedSender<SpawnRequest>,
    mount_timeout: Duration,
}

impl SyncNode {
    /// Builds the node and starts its background loops. Must be called from
    /// within a tokio runtime.
    pub fn new(
        node_id: impl Into<String>,
        router: Arc<CommandRouter>,
        outbound: Arc<dyn Outbound>,
        store: Arc<dyn ReplicaStore>,
        registry: BehaviorRegistry,
        mount_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let node_id = node_id.into();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        let control = router.subscribe(
            &[Command::Register, Command::Login, Command::Reload, Command::Error],
            MessageFilter::Any,
        );

        let node = Arc::new(Self {
            reconciler: Arc::new(Reconciler::new(node_id.clone(), store)),
            node_id,
            router,
            outbound,
            registry,
            family: FamilyBroadcaster::new(),
            actors: DashMap::new(),
            internal: internal_tx,
            spawner: spawn_tx,
            mount_timeout,
        });

        tokio::spawn(supervise(Arc::downgrade(&node), internal_rx, events_tx));
        tokio::spawn(spawn_children(Arc::downgrade(&node), spawn_rx));
        tokio::spawn(serve_control(Arc::downgrade(&node), control));
        info!(node_id = %node.node_id, behaviors = node.registry.len(), "sync node ready");
        (node, events_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn family(&self) -> &FamilyBroadcaster {
        &self.family
    }

    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        self.reconciler.store()
    }

    pub fn handle(&self, instance_id: &str) -> Option<TaskHandle> {
        self.actors.get(instance_id).map(|h| h.clone())
    }

    pub fn instances(&self) -> Vec<String> {
        self.actors.iter().map(|e| e.key().clone()).collect()
    }

    /// Forwards channel lifecycle changes as node events. A forced reload
    /// rejoins every mounted instance once the channel is back up.
    pub fn watch_channel(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut reload_pending = false;
            let mut dropped = false;
            while let Some(event) = events.recv().await {
                let Some(node) = weak.upgrade() else { break };
                match event {
                    ChannelEvent::Connected => {
                        node.emit(NodeEvent::Connected);
                        node.announce();
                        if reload_pending {
                            reload_pending = false;
                            let rejoined = node.reload().await;
                            node.emit(NodeEvent::Reloaded { rejoined });
                        } else {
                            if dropped {
                                node.rejoin_mounted();
                            }
                            // Intents kept by failed sends go out now.
                            for entry in node.actors.iter() {
                                let _ = entry.value().tick();
                            }
                        }
                        dropped = false;
                    }
                    ChannelEvent::Disconnected => {
                        dropped = true;
                        node.emit(NodeEvent::Disconnected);
                    }
                    ChannelEvent::ReloadRequired => reload_pending = true,
                    ChannelEvent::GaveUp => node.emit(NodeEvent::GaveUp),
                }
            }
        });
    }

    /// Sends `register` on a fresh connection; the hub acks with its id.
    pub fn announce(&self) {
        let task = json!({ "nodeId": self.node_id });
        if let Err(e) = self.outbound.send(Command::Register, task) {
            warn!(node_id = %self.node_id, error = %e, "register not sent");
        }
    }

    /// Re-announces every mounted instance on a fresh connection. The hub
    /// answers each with a `join` snapshot, which the running actor rebases on.
    pub fn rejoin_mounted(&self) -> usize {
        let mut sent = 0;
        for instance_id in self.instances() {
            let task = json!({
                "instanceId": instance_id,
                "node": { "commandArgs": { "instanceId": instance_id } },
            });
            match self.outbound.send(Command::Start, task) {
                Ok(_) => sent += 1,
                Err(e) => warn!(instance_id = %instance_id, error = %e, "rejoin not sent"),
            }
        }
        if sent > 0 {
            info!(node_id = %self.node_id, count = sent, "rejoined mounted instances after reconnect");
        }
        sent
    }

    /// Asks the hub for a new instance and mounts it once `init` arrives.
    pub async fn start_task(&self, request: StartRequest) -> SyncResult<TaskHandle> {
        let args = CommandArgs {
            id: Some(request.id.clone()),
            prev_instance_id: request.prev_instance_id,
            parent_instance_id: request.parent_instance_id,
            ..Default::default()
        };
        let mut task = json!({ "id": request.id });
        if !request.input.is_empty() {
            set_path(&mut task, "input", Value::Object(request.input));
        }
        self.request_instance(args, task).await
    }

    /// Mounts an existing instance, asking the hub for its current snapshot.
    pub async fn join_task(&self, instance_id: &str) -> SyncResult<TaskHandle> {
        if let Some(handle) = self.handle(instance_id) {
            return Ok(handle);
        }
        self.router.restore_instance(instance_id);
        let args = CommandArgs {
            instance_id: Some(instance_id.to_string()),
            ..Default::default()
        };
        self.request_instance(args, json!({ "instanceId": instance_id })).await
    }

    async fn request_instance(&self, mut args: CommandArgs, mut task: Value) -> SyncResult<TaskHandle> {
        let initiator = args
            .prev_instance_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let mut replies = self.router.subscribe(
            &[Command::Init, Command::Join, Command::Error],
            MessageFilter::Initiator(initiator.clone()),
        );
        set_path(&mut task, "node.commandArgs", serde_json::to_value(&args)?);
        self.outbound.send(Command::Start, task)?;
        debug!(%initiator, "start sent");

        let reply = self.await_reply(&initiator, &mut replies).await?;
        self.router.unsubscribe(replies.id);
        if reply.command == Command::Error {
            return Err(SyncError::RemoteTask(reply.error_text()));
        }
        self.mount(Task::from_value(reply.task)?).await
    }

    async fn await_reply(&self, initiator: &str, replies: &mut Subscription) -> SyncResult<InboundMessage> {
        match timeout(self.mount_timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(SyncError::NotMounted(initiator.to_string())),
            Err(_) => Err(SyncError::MountTimeout {
                instance_id: initiator.to_string(),
                timeout: self.mount_timeout,
            }),
        }
    }

    /// Takes ownership of `task`: seeds the replica, subscribes to its
    /// messages and starts its actor. Fails if the first step does not
    /// finish within the mount timeout.
    pub async fn mount(&self, task: Task) -> SyncResult<TaskHandle> {
        let instance_id = task
            .instance_id()
            .ok_or_else(|| SyncError::Protocol("task has no instanceId".to_string()))?
            .to_string();
        if let Some(handle) = self.handle(&instance_id) {
            return Ok(handle);
        }
        let behavior = self.registry.resolve(&task.id)?;
        self.store().set(&instance_id, task.to_value()?).await?;

        let inbound = self.router.subscribe(
            &[Command::Update, Command::Partial, Command::Error, Command::Join],
            MessageFilter::Instance(instance_id.clone()),
        );
        let (actor, handle) = TaskActor::new(task, behavior, inbound, self.actor_context())?;
        let (mounted_tx, mounted_rx) = oneshot::channel();
        // Registered before the actor runs so an early completion can evict it.
        self.actors.insert(instance_id.clone(), handle.clone());
        tokio::spawn(actor.run(mounted_tx));

        let failure = match timeout(self.mount_timeout, mounted_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(instance_id = %instance_id, node_id = %self.node_id, "task mounted");
                self.emit(NodeEvent::Mounted { instance_id });
                return Ok(handle);
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => SyncError::NotMounted(instance_id.clone()),
            Err(_) => SyncError::MountTimeout {
                instance_id: instance_id.clone(),
                timeout: self.mount_timeout,
            },
        };
        self.actors.remove(&instance_id);
        self.router.unsubscribe(handle.subscription());
        handle.shutdown();
        Err(failure)
    }

    fn actor_context(&self) -> ActorContext {
        ActorContext {
            node_id: self.node_id.clone(),
            reconciler: self.reconciler.clone(),
            outbound: self.outbound.clone(),
            family: self.family.clone(),
            node_events: self.internal.clone(),
            spawner: self.spawner.clone(),
        }
    }

    fn mounted(&self, instance_id: &str) -> SyncResult<TaskHandle> {
        self.handle(instance_id)
            .ok_or_else(|| SyncError::NotMounted(instance_id.to_string()))
    }

    /// Local edit, diffed and sent by the actor on its next step.
    pub fn modify(&self, instance_id: &str, patch: Patch) -> SyncResult<()> {
        self.mounted(instance_id)?.modify(patch)
    }

    pub fn set_state(&self, instance_id: &str, state: &str) -> SyncResult<()> {
        self.mounted(instance_id)?.set_state(state)
    }

    pub fn tick(&self, instance_id: &str) -> SyncResult<()> {
        self.mounted(instance_id)?.send(TaskEvent::Tick)
    }

    /// Stops the actor and drops everything this node kept for the instance.
    pub async fn evict(&self, instance_id: &str) -> SyncResult<()> {
        if let Some((_, handle)) = self.actors.remove(instance_id) {
            self.router.unsubscribe(handle.subscription());
            handle.shutdown();
        }
        self.reconciler.forget(instance_id);
        self.router.discard_instance(instance_id);
        self.store().remove(instance_id).await?;
        debug!(instance_id, "evicted");
        Ok(())
    }

    /// Drops all local state and rejoins every instance that was mounted.
    /// Returns how many came back.
    pub async fn reload(&self) -> usize {
        let instances = self.instances();
        warn!(count = instances.len(), "reloading all instances from the hub");
        for instance_id in &instances {
            if let Err(e) = self.evict(instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "evict failed during reload");
            }
        }
        let mut rejoined = 0;
        for instance_id in &instances {
            match self.join_task(instance_id).await {
                Ok(_) => rejoined += 1,
                Err(e) => error!(instance_id = %instance_id, error = %e, "rejoin failed"),
            }
        }
        rejoined
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.internal.send(event);
    }
}

/// Forwards actor and node events, evicting instances that finished or failed.
async fn supervise(
    node: Weak<SyncNode>,
    mut internal: mpsc::UnboundedReceiver<NodeEvent>,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    while let Some(event) = internal.recv().await {
        let Some(strong) = node.upgrade() else { break };
        match &event {
            NodeEvent::Completed { instance_id } | NodeEvent::InstanceFailed { instance_id, .. } => {
                if let Err(e) = strong.evict(instance_id).await {
                    warn!(instance_id = %instance_id, error = %e, "evict failed");
                }
            }
            _ => {}
        }
        drop(strong);
        if events.send(event).is_err() {
            debug!("node event receiver dropped");
        }
    }
}

/// Starts children one at a time, each only after the previous `init`.
async fn spawn_children(node: Weak<SyncNode>, mut requests: mpsc::UnboundedReceiver<SpawnRequest>) {
    while let Some(request) = requests.recv().await {
        let Some(node) = node.upgrade() else { break };
        for child in request.children {
            let start = StartRequest::new(child.id.clone())
                .with_input(child.input)
                .with_parent(request.parent_instance_id.clone());
            match node.start_task(start).await {
                Ok(handle) => {
                    info!(parent = %request.parent_instance_id, child = %handle.instance_id(), definition = %child.id, "child started");
                    if let Some(parent) = node.handle(&request.parent_instance_id) {
                        let _ = parent.send(TaskEvent::ChildStarted(handle.instance_id().to_string()));
                    }
                }
                Err(e) => {
                    warn!(parent = %request.parent_instance_id, definition = %child.id, error = %e, "child start failed");
                    node.emit(NodeEvent::ChildFailed {
                        parent_instance_id: request.parent_instance_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Node-wide commands: registration acks, login, hub-initiated reloads and
/// errors no instance claimed.
async fn serve_control(node: Weak<SyncNode>, mut control: Subscription) {
    while let Some(msg) = control.recv().await {
        let Some(node) = node.upgrade() else { break };
        match msg.command {
            Command::Register => {
                info!(node_id = %node.node_id, "registered with hub");
                node.emit(NodeEvent::Registered(msg.task));
            }
            Command::Login => {
                let user = lookup(&msg.task, "user").cloned().unwrap_or(msg.task);
                node.emit(NodeEvent::Login(user));
            }
            Command::Reload => {
                let rejoined = node.reload().await;
                node.emit(NodeEvent::Reloaded { rejoined });
            }
            Command::Error => {
                let message = msg.error_text();
                warn!(instance_id = ?msg.instance_id(), %message, "unclaimed remote error");
                node.emit(NodeEvent::RemoteError {
                    instance_id: msg.instance_id().map(str::to_string),
                    message,
                });
            }
            other => debug!(command = %other, "ignored on control subscription"),
        }
    }
}
