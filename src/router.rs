use std::collections::{BTreeMap, HashSet};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use crate::error::{SyncError, SyncResult};
use crate::task::{Command, Envelope, InboundMessage};

/// Entries beyond this are dropped oldest-first.
const MAX_BACKLOG: usize = 10_000;

/// Which messages a subscriber wants, beyond the command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    Any,
    /// Messages for one instance.
    Instance(String),
    /// `init`/`join`/`error` replies addressed to whoever started a task,
    /// matched on `prevInstanceId` or `parentInstanceId`.
    Initiator(String),
}

impl MessageFilter {
    pub fn matches(&self, msg: &InboundMessage) -> bool {
        match self {
            MessageFilter::Any => true,
            MessageFilter::Instance(id) => msg.instance_id() == Some(id.as_str()),
            MessageFilter::Initiator(id) => {
                msg.prev_instance_id() == Some(id.as_str())
                    || msg.parent_instance_id() == Some(id.as_str())
            }
        }
    }

    fn is_specific(&self) -> bool {
        !matches!(self, MessageFilter::Any)
    }
}

/// Receiving end of a router subscription. Dropping it unsubscribes.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: u64,
    commands: Vec<Command>,
    filter: MessageFilter,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl Subscriber {
    fn wants(&self, msg: &InboundMessage) -> bool {
        !self.tx.is_closed() && self.commands.contains(&msg.command) && self.filter.matches(msg)
    }
}

#[derive(Default)]
struct RouterState {
    next_seq: u64,
    next_subscriber: u64,
    backlog: BTreeMap<u64, InboundMessage>,
    subscribers: Vec<Subscriber>,
    // Instances evicted here; their updates and partials are dropped on arrival.
    discarded: HashSet<String>,
}

impl RouterState {
    /// Delivers backlog entries oldest first. Each entry goes to exactly one
    /// subscriber (specific filters before `Any`) and is removed once taken.
    fn drain(&mut self) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        let seqs: Vec<u64> = self.backlog.keys().copied().collect();
        for seq in seqs {
            let Some(msg) = self.backlog.get(&seq) else { continue };
            let target = self
                .subscribers
                .iter()
                .position(|s| s.filter.is_specific() && s.wants(msg))
                .or_else(|| self.subscribers.iter().position(|s| s.wants(msg)));
            let Some(index) = target else { continue };
            if let Some(msg) = self.backlog.remove(&seq) {
                if let Err(mpsc::error::SendError(msg)) = self.subscribers[index].tx.send(msg) {
                    // Receiver went away between the check and the send.
                    self.subscribers.remove(index);
                    self.backlog.insert(seq, msg);
                }
            }
        }
    }
}

/// 命令路由 (Command Router)
/// Ordered, replayable inbox demultiplexed by command type.
#[derive(Default)]
pub struct CommandRouter {
    state: parking_lot::Mutex<RouterState>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a raw frame and dispatches it. `pong` is swallowed here.
    pub fn dispatch_raw(&self, raw: &str) -> SyncResult<()> {
        let envelope = Envelope::decode(raw)?;
        let command = envelope
            .command()
            .ok_or_else(|| SyncError::Protocol("missing or unknown node.command".to_string()))?;
        match command {
            Command::Pong | Command::Ping => {
                trace!(%command, "heartbeat");
                Ok(())
            }
            _ => {
                self.dispatch(command, envelope.task);
                Ok(())
            }
        }
    }

    /// Appends a message to the backlog and drains. Returns its sequence.
    pub fn dispatch(&self, command: Command, task: Value) -> u64 {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        if matches!(command, Command::Update | Command::Partial) {
            let instance_id = task.get("instanceId").and_then(Value::as_str);
            if let Some(id) = instance_id.filter(|id| state.discarded.contains(*id)) {
                trace!(seq, %command, instance_id = id, "dropping message for evicted instance");
                return seq;
            }
        }
        state.backlog.insert(seq, InboundMessage { seq, command, task });
        while state.backlog.len() > MAX_BACKLOG {
            if let Some((dropped, msg)) = state.backlog.pop_first() {
                warn!(seq = dropped, command = %msg.command, "backlog full, dropping oldest");
            }
        }
        state.drain();
        seq
    }

    /// Subscribes to `commands` under `filter`. Anything already waiting in
    /// the backlog that matches is delivered immediately, oldest first.
    pub fn subscribe(&self, commands: &[Command], filter: MessageFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if let MessageFilter::Instance(id) = &filter {
            state.discarded.remove(id);
        }
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state.subscribers.push(Subscriber {
            id,
            commands: commands.to_vec(),
            filter,
            tx,
        });
        state.drain();
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.retain(|s| s.id != id);
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    /// Drops backlog entries for an instance that is no longer mounted here,
    /// and any update or partial for it that arrives later.
    pub fn discard_instance(&self, instance_id: &str) {
        let mut state = self.state.lock();
        state.backlog.retain(|_, msg| msg.instance_id() != Some(instance_id));
        state.discarded.insert(instance_id.to_string());
    }

    /// Accepts messages for `instance_id` again, ahead of a rejoin.
    pub fn restore_instance(&self, instance_id: &str) {
        self.state.lock().discarded.remove(instance_id);
    }
}
