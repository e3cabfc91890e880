use std::sync::Arc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use crate::channel::Outbound;
use crate::error::{SyncError, SyncResult};
use crate::family::{FamilyBroadcaster, FamilyDiff};
use crate::machine::{ChildSpec, Effects, PartialAccumulator, PartialChunk, StateTracker, StepContext, TaskBehavior};
use crate::router::Subscription;
use crate::runtime::node::NodeEvent;
use crate::sync::diff::{diff, Patch, PatchOp};
use crate::sync::integrity;
use crate::sync::lock;
use crate::sync::reconcile::Reconciler;
use crate::task::{set_path, Command, CommandArgs, InboundMessage, Task};

/// A state change chains into another handler run, up to this many per wake-up.
const MAX_CHAINED_STEPS: usize = 16;

/// Fields that never take part in the outbound diff.
const CONTROL_KEYS: &[&str] = &["node", "command", "commandArgs", "commandDescription"];

/// Local events fed to a task actor.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Local edit to the live document.
    Modify(Patch),
    /// Force `state.current`, as an external party would.
    SetState(String),
    /// Wake the handler without any change.
    Tick,
    ChildStarted(String),
    Shutdown,
}

/// What observers see of a running instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskView {
    pub task: Task,
    pub partial_text: String,
    pub partial_final: bool,
}

/// Children to start, in order, on behalf of `parent_instance_id`.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub parent_instance_id: String,
    pub children: Vec<ChildSpec>,
}

/// Handle to a mounted instance.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    instance_id: String,
    subscription: u64,
    events: mpsc::UnboundedSender<TaskEvent>,
    view: watch::Receiver<TaskView>,
}

impl TaskHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Router subscription feeding this instance.
    pub fn subscription(&self) -> u64 {
        self.subscription
    }

    pub fn view(&self) -> TaskView {
        self.view.borrow().clone()
    }

    pub fn task(&self) -> Task {
        self.view.borrow().task.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    pub fn send(&self, event: TaskEvent) -> SyncResult<()> {
        self.events
            .send(event)
            .map_err(|_| SyncError::NotMounted(self.instance_id.clone()))
    }

    pub fn modify(&self, patch: Patch) -> SyncResult<()> {
        self.send(TaskEvent::Modify(patch))
    }

    pub fn set_state(&self, state: impl Into<String>) -> SyncResult<()> {
        self.send(TaskEvent::SetState(state.into()))
    }

    pub fn tick(&self) -> SyncResult<()> {
        self.send(TaskEvent::Tick)
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(TaskEvent::Shutdown);
    }

    /// Waits until the view satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&TaskView) -> bool) -> SyncResult<TaskView> {
        let mut view = self.view.clone();
        let seen = view
            .wait_for(predicate)
            .await
            .map_err(|_| SyncError::NotMounted(self.instance_id.clone()))?;
        Ok(seen.clone())
    }
}

/// Collaborators an actor needs from its node.
#[derive(Clone)]
pub struct ActorContext {
    pub node_id: String,
    pub reconciler: Arc<Reconciler>,
    pub outbound: Arc<dyn Outbound>,
    pub family: FamilyBroadcaster,
    pub node_events: mpsc::UnboundedSender<NodeEvent>,
    pub spawner: mpsc::UnboundedSender<SpawnRequest>,
}

/// 任务实例执行者 (Task Actor)
/// Owns one instance's live document and runs its handler on every inbound
/// message, local event or tick, strictly one at a time.
pub struct TaskActor {
    instance_id: String,
    behavior: Arc<dyn TaskBehavior>,
    cx: ActorContext,
    live: Task,
    /// Live document as of the last send or applied update.
    orig: Value,
    tracker: StateTracker,
    partial: PartialAccumulator,
    inbound: Subscription,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    view: watch::Sender<TaskView>,
}

impl TaskActor {
    pub fn new(
        task: Task,
        behavior: Arc<dyn TaskBehavior>,
        inbound: Subscription,
        cx: ActorContext,
    ) -> SyncResult<(Self, TaskHandle)> {
        let instance_id = task
            .instance_id()
            .ok_or_else(|| SyncError::Protocol("task has no instanceId".to_string()))?
            .to_string();
        let orig = task.to_value()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(TaskView {
            task: task.clone(),
            ..Default::default()
        });
        let actor = Self {
            instance_id: instance_id.clone(),
            behavior,
            cx,
            live: task,
            orig,
            tracker: StateTracker::new(),
            partial: PartialAccumulator::new(),
            inbound,
            events: events_rx,
            view: view_tx,
        };
        let handle = TaskHandle {
            instance_id,
            subscription: actor.inbound.id,
            events: events_tx,
            view: view_rx,
        };
        Ok((actor, handle))
    }

    /// Mounts, reports the outcome on `mounted`, then serves events until
    /// shutdown, completion, or a fatal error.
    pub async fn run(mut self, mounted: oneshot::Sender<SyncResult<()>>) {
        if let Err(e) = self.mount().await {
            error!(instance_id = %self.instance_id, error = %e, "mount failed");
            let _ = mounted.send(Err(e));
            return;
        }
        let _ = mounted.send(Ok(()));

        loop {
            if self.is_finished() {
                info!(instance_id = %self.instance_id, "task done");
                let _ = self.cx.node_events.send(NodeEvent::Completed {
                    instance_id: self.instance_id.clone(),
                });
                break;
            }

            let outcome = tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.on_inbound(msg).await,
                    None => break,
                },
                event = self.events.recv() => match event {
                    Some(TaskEvent::Shutdown) | None => break,
                    Some(event) => self.on_event(event).await,
                },
            };

            if let Err(e) = outcome {
                if e.is_fatal() {
                    error!(instance_id = %self.instance_id, error = %e, "task instance failed");
                    let _ = self.cx.node_events.send(NodeEvent::InstanceFailed {
                        instance_id: self.instance_id.clone(),
                        error: e.to_string(),
                    });
                    break;
                }
                warn!(instance_id = %self.instance_id, error = %e, "event dropped");
            }
        }
        debug!(instance_id = %self.instance_id, "actor stopped");
    }

    fn is_finished(&self) -> bool {
        self.live.is_done() && self.live.command.is_none() && self.live.node.command_pending.is_none()
    }

    async fn mount(&mut self) -> SyncResult<()> {
        let initial = self.behavior.initial_state().to_string();
        if self.behavior.reset_on_mount() || self.live.state.current.is_none() {
            self.live.state.current = Some(initial);
        }
        self.tracker.reset();
        self.step().await
    }

    async fn on_inbound(&mut self, msg: InboundMessage) -> SyncResult<()> {
        match msg.command {
            Command::Update => {
                let live = self.live.to_value()?;
                let reconciled = self
                    .cx
                    .reconciler
                    .apply_update(&self.instance_id, &live, &msg.task)
                    .await?;
                let Some(reconciled) = reconciled else {
                    return Ok(());
                };
                self.orig = reconciled.applied.apply(&self.orig);
                self.live = Task::from_value(reconciled.live)?;
                if reconciled.confirmed {
                    debug!(instance_id = %self.instance_id, "pending update confirmed");
                }
            }
            Command::Partial => match PartialChunk::from_task(&msg.task) {
                Some(chunk) => {
                    self.partial.push(&chunk);
                }
                None => {
                    debug!(instance_id = %self.instance_id, "partial without payload");
                    return Ok(());
                }
            },
            Command::Error => {
                let message = msg.error_text();
                warn!(instance_id = %self.instance_id, %message, "remote task error");
                self.live.node.command_pending = None;
                let _ = self.cx.node_events.send(NodeEvent::RemoteError {
                    instance_id: Some(self.instance_id.clone()),
                    message,
                });
                self.publish();
                return Ok(());
            }
            Command::Join | Command::Init => {
                // Full snapshot from the hub. Unsent local edits and the
                // queued intent are carried over on top of it.
                let local = diff(&strip_control(&self.orig), &strip_control(&self.live.to_value()?));
                let snapshot = Task::from_value(msg.task.clone())?;
                self.cx.reconciler.store().set(&self.instance_id, msg.task).await?;
                self.orig = snapshot.to_value()?;
                let mut next = Task::from_value(local.apply(&self.orig))?;
                next.command = self.live.command.take();
                next.command_args = std::mem::take(&mut self.live.command_args);
                next.command_description = self.live.command_description.take();
                next.node.command_pending = None;
                self.live = next;
                debug!(instance_id = %self.instance_id, kept = local.len(), "rebased on hub snapshot");
            }
            other => {
                debug!(instance_id = %self.instance_id, command = %other, "ignored");
                return Ok(());
            }
        }
        self.step().await
    }

    async fn on_event(&mut self, event: TaskEvent) -> SyncResult<()> {
        match event {
            TaskEvent::Modify(patch) => {
                let merged = patch.apply(&self.live.to_value()?);
                let next = Task::from_value(merged)?;
                self.check_command(next.command)?;
                self.live = next;
            }
            TaskEvent::SetState(state) => {
                if !self.behavior.declares(&state) {
                    return Err(self.unknown_state(state));
                }
                self.live.state.last = self.live.state.current.take();
                self.live.state.current = Some(state);
            }
            TaskEvent::ChildStarted(child) => {
                if !self.live.meta.children_id.contains(&child) {
                    self.live.meta.children_id.push(child);
                }
            }
            TaskEvent::Tick => {}
            TaskEvent::Shutdown => return Ok(()),
        }
        self.step().await
    }

    fn unknown_state(&self, state: String) -> SyncError {
        SyncError::UnknownState {
            definition: self.live.id.clone(),
            state,
        }
    }

    /// A pending command may only be replaced by the same command.
    fn check_command(&self, attempted: Option<Command>) -> SyncResult<()> {
        match (self.live.command, attempted) {
            (Some(pending), Some(attempted)) if pending != attempted => Err(SyncError::CommandRegression {
                instance_id: self.instance_id.clone(),
                pending,
                attempted,
            }),
            _ => Ok(()),
        }
    }

    async fn step(&mut self) -> SyncResult<()> {
        for _ in 0..MAX_CHAINED_STEPS {
            if !self.step_once().await? {
                break;
            }
        }
        self.publish();
        Ok(())
    }

    /// One handler run. Returns true if the state changed.
    async fn step_once(&mut self) -> SyncResult<bool> {
        let Some(state) = self.live.current_state().map(str::to_string) else {
            return Ok(false);
        };
        if !self.behavior.declares(&state) {
            return Err(self.unknown_state(state));
        }
        if !self.tracker.is_ready(Some(&state)) {
            debug!(instance_id = %self.instance_id, %state, requested = ?self.tracker.requested(), "state change pending, skipping");
            self.flush().await?;
            return Ok(false);
        }

        let (next, effects) = {
            let mut ctx = StepContext::new(&self.live, &self.cx.node_id, &self.tracker, &self.partial);
            let next = self.behavior.step(&mut ctx).await?;
            (next, ctx.into_effects())
        };

        self.apply_effects(effects)?;
        let changed = match next {
            Some(next) if next != state => {
                if !self.behavior.declares(&next) {
                    return Err(self.unknown_state(next));
                }
                self.modify_state(&state, &next);
                true
            }
            _ => false,
        };
        self.tracker.observe(Some(&state));
        self.flush().await?;
        Ok(changed)
    }

    fn apply_effects(&mut self, effects: Effects) -> SyncResult<()> {
        if !effects.patch.is_empty() {
            let merged = effects.patch.apply(&self.live.to_value()?);
            let next = Task::from_value(merged)?;
            self.check_command(next.command)?;
            self.live = next;
        }
        if let Some(intent) = effects.intent {
            self.check_command(Some(intent.command))?;
            self.live.command = Some(intent.command);
            self.live.command_args = intent.args;
            self.live.command_description = intent.description;
        }
        if !effects.children.is_empty() {
            let request = SpawnRequest {
                parent_instance_id: self.instance_id.clone(),
                children: effects.children,
            };
            if self.cx.spawner.send(request).is_err() {
                warn!(instance_id = %self.instance_id, "node is gone, children not started");
            }
        }
        Ok(())
    }

    fn modify_state(&mut self, from: &str, next: &str) {
        self.live.state.last = Some(from.to_string());
        self.live.state.current = Some(next.to_string());
        self.tracker.request(Some(from), next);
    }

    /// Sends the pending one-shot command, if nothing holds it back.
    async fn flush(&mut self) -> SyncResult<()> {
        let Some(command) = self.live.command else {
            return Ok(());
        };
        if command == Command::Update && self.live.node.command_pending.is_some() {
            debug!(instance_id = %self.instance_id, "update deferred until the previous one is confirmed");
            return Ok(());
        }
        if lock::is_locked(&self.live, &self.cx.node_id) && !self.live.command_args.lock_bypass {
            debug!(instance_id = %self.instance_id, holder = ?self.live.locked_by(), "write deferred while locked");
            return Ok(());
        }

        let stored = self
            .cx
            .reconciler
            .store()
            .get(&self.instance_id)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new()));
        let live = self.live.to_value()?;
        let changes = diff(&strip_control(&self.orig), &strip_control(&live)).prune_against(&stored);
        let args = self.live.command_args.clone();
        let body = if args.sync { changes.wholesale(&live) } else { changes };

        let mut wire = body.clone();
        wire.insert("id", PatchOp::Set(Value::String(self.live.id.clone())));
        wire.insert("instanceId", PatchOp::Set(Value::String(self.instance_id.clone())));
        if let Some(family_id) = &self.live.family_id {
            wire.insert("familyId", PatchOp::Set(Value::String(family_id.clone())));
        }
        let hash_diff = integrity::scoped_fingerprint(&stored, &wire);
        let mut message = wire.to_value();
        set_path(&mut message, "meta.hash", Value::from(integrity::fingerprint(&stored)));
        set_path(&mut message, "meta.hashDiff", Value::from(hash_diff));
        if let Some(id) = self.live.meta.message_id {
            set_path(&mut message, "meta.messageId", Value::from(id));
        }
        if !args.is_empty() {
            set_path(&mut message, "node.commandArgs", serde_json::to_value(&args)?);
        }
        if let Some(description) = &self.live.command_description {
            set_path(&mut message, "node.commandDescription", Value::String(description.clone()));
        }

        match self.cx.outbound.send(command, message) {
            Ok(message_id) => {
                debug!(instance_id = %self.instance_id, %command, message_id, keys = body.len(), "command sent");
                self.live.command = None;
                self.live.command_args = CommandArgs::default();
                self.live.command_description = None;
                self.live.meta.prev_message_id = self.live.meta.message_id;
                self.live.meta.message_id = Some(message_id);
                if command == Command::Update {
                    self.live.node.command_pending = Some(Command::Update);
                }
                self.orig = self.live.to_value()?;
                self.publish_family(body);
                Ok(())
            }
            Err(SyncError::Transport(reason)) => {
                warn!(instance_id = %self.instance_id, %command, %reason, "send failed, intent kept");
                let _ = self.cx.node_events.send(NodeEvent::SendFailed {
                    instance_id: self.instance_id.clone(),
                    error: reason,
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn publish_family(&self, patch: Patch) {
        if patch.is_empty() || !self.live.publishes_family_diffs() {
            return;
        }
        if let Some(family_id) = &self.live.family_id {
            self.cx.family.publish(FamilyDiff {
                family_id: family_id.clone(),
                instance_id: self.instance_id.clone(),
                patch,
            });
        }
    }

    fn publish(&self) {
        self.view.send_replace(TaskView {
            task: self.live.clone(),
            partial_text: self.partial.text().to_string(),
            partial_final: self.partial.is_final(),
        });
    }
}

fn strip_control(doc: &Value) -> Value {
    match doc {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !CONTROL_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
