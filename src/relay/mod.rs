use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use anyhow::Context as AnyhowContext;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use crate::channel::sequencer::now_millis;
use crate::channel::Link;
use crate::error::{SyncError, SyncResult};
use crate::sync::diff::Patch;
use crate::sync::lock::{arbitrate, lock_holder, LockRequest};
use crate::task::{lookup, set_path, Command, Envelope};

pub mod server;

/// What a freshly started instance of a definition looks like.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DefinitionTemplate {
    pub initial: String,
    pub config: Map<String, Value>,
    pub input: Map<String, Value>,
}

impl Default for DefinitionTemplate {
    fn default() -> Self {
        Self {
            initial: "start".to_string(),
            config: Map::new(),
            input: Map::new(),
        }
    }
}

/// Reads a YAML map of definition id -> template.
pub fn load_templates(path: &Path) -> anyhow::Result<HashMap<String, DefinitionTemplate>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read task definitions from {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to deserialize task definitions from {}", path.display()))
}

struct Peer {
    node_id: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

/// 中继 (Relay)
/// In-memory hub: allocates instances, arbitrates locks and fans updates
/// out to every node that mounted the instance.
pub struct Relay {
    hub_id: String,
    docs: DashMap<String, Value>,
    members: DashMap<String, HashSet<u64>>,
    peers: DashMap<u64, Peer>,
    templates: HashMap<String, DefinitionTemplate>,
    next_peer: AtomicU64,
}

impl Relay {
    pub fn new(templates: HashMap<String, DefinitionTemplate>) -> Arc<Self> {
        Arc::new(Self {
            hub_id: format!("hub-{}", Uuid::new_v4()),
            docs: DashMap::new(),
            members: DashMap::new(),
            peers: DashMap::new(),
            templates,
            next_peer: AtomicU64::new(1),
        })
    }

    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    /// Current relay copy of an instance.
    pub fn document(&self, instance_id: &str) -> Option<Value> {
        self.docs.get(instance_id).map(|d| d.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Connected peers currently receiving an instance's updates.
    pub fn member_count(&self, instance_id: &str) -> usize {
        self.members.get(instance_id).map_or(0, |m| m.len())
    }

    /// Serves every link handed over on `links`, e.g. by a `MemoryConnector`.
    pub fn accept(self: &Arc<Self>, mut links: mpsc::UnboundedReceiver<Link>) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(link) = links.recv().await {
                relay.attach(link);
            }
        })
    }

    /// Serves one connected peer until its link drops.
    pub fn attach(self: &Arc<Self>, link: Link) -> JoinHandle<()> {
        let Link { outgoing, mut incoming } = link;
        let peer = self.next_peer.fetch_add(1, Ordering::SeqCst);
        self.peers.insert(peer, Peer { node_id: None, tx: outgoing });
        debug!(peer, "peer attached");

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = incoming.recv().await {
                if let Err(e) = relay.handle_frame(peer, &raw) {
                    warn!(peer, error = %e, "dropping frame");
                }
            }
            relay.detach(peer);
        })
    }

    fn detach(&self, peer: u64) {
        let node_id = self.peers.remove(&peer).and_then(|(_, p)| p.node_id);
        for mut entry in self.members.iter_mut() {
            entry.value_mut().remove(&peer);
        }
        debug!(peer, ?node_id, "peer detached");
    }

    pub fn handle_frame(&self, peer: u64, raw: &str) -> SyncResult<()> {
        let envelope = Envelope::decode(raw)?;
        let command = envelope
            .command()
            .ok_or_else(|| SyncError::Protocol("missing or unknown node.command".to_string()))?;
        let sender = lookup(&envelope.task, "node.id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let (Some(node_id), Some(mut p)) = (&sender, self.peers.get_mut(&peer)) {
            if p.node_id.is_none() {
                p.node_id = Some(node_id.clone());
            }
        }
        let initiator = sender.unwrap_or_else(|| format!("peer-{}", peer));

        match command {
            Command::Ping => {
                trace!(peer, "ping");
                self.send_to(peer, Command::Pong, json!({}));
                Ok(())
            }
            Command::Register => {
                info!(peer, node_id = %initiator, "node registered");
                self.send_to(peer, Command::Register, json!({ "hubId": self.hub_id, "nodeId": initiator }));
                Ok(())
            }
            Command::Start => self.on_start(peer, &initiator, envelope.task),
            Command::Update => self.on_update(peer, &initiator, envelope.task),
            Command::Partial => self.on_partial(peer, &initiator, envelope.task),
            other => {
                debug!(peer, command = %other, "ignored by relay");
                Ok(())
            }
        }
    }

    fn on_start(&self, peer: u64, initiator: &str, task: Value) -> SyncResult<()> {
        let args = lookup(&task, "node.commandArgs").cloned().unwrap_or(Value::Null);
        let arg = |name: &str| args.get(name).and_then(Value::as_str).map(str::to_string);
        let correlation = arg("prevInstanceId");

        if let Some(instance_id) = arg("instanceId") {
            return self.on_join(peer, &instance_id, correlation);
        }

        let Some(id) = arg("id").or_else(|| task.get("id").and_then(Value::as_str).map(str::to_string)) else {
            self.reply_error(peer, None, correlation, "start without a task definition id");
            return Ok(());
        };
        let template = match self.templates.get(&id) {
            Some(t) => t.clone(),
            None => {
                debug!(definition = %id, "no template, using defaults");
                DefinitionTemplate::default()
            }
        };
        let parent = arg("parentInstanceId");
        let instance_id = Uuid::new_v4().to_string();
        let family_id = parent
            .as_deref()
            .and_then(|p| self.docs.get(p))
            .and_then(|doc| doc.get("familyId").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| instance_id.clone());

        let mut input = template.input.clone();
        if let Some(Value::Object(given)) = task.get("input") {
            input.extend(given.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let mut doc = json!({
            "id": id,
            "instanceId": instance_id,
            "familyId": family_id,
            "state": { "current": template.initial },
            "meta": {
                "founder": initiator,
                "updatedAt": now_millis(),
            },
        });
        if !input.is_empty() {
            set_path(&mut doc, "input", Value::Object(input));
        }
        if !template.config.is_empty() {
            set_path(&mut doc, "config", Value::Object(template.config));
        }
        if let Some(parent) = &parent {
            set_path(&mut doc, "meta.parentInstanceId", Value::String(parent.clone()));
        }
        if let Some(correlation) = &correlation {
            set_path(&mut doc, "meta.prevInstanceId", Value::String(correlation.clone()));
        }

        self.docs.insert(instance_id.clone(), doc.clone());
        self.join_member(&instance_id, peer);
        info!(instance_id = %instance_id, definition = %id, founder = %initiator, "instance started");
        self.send_to(peer, Command::Init, doc);
        Ok(())
    }

    fn on_join(&self, peer: u64, instance_id: &str, correlation: Option<String>) -> SyncResult<()> {
        let Some(mut doc) = self.document(instance_id) else {
            self.reply_error(peer, Some(instance_id), correlation, "unknown instance");
            return Ok(());
        };
        set_path(
            &mut doc,
            "meta.prevInstanceId",
            correlation.map(Value::String).unwrap_or(Value::Null),
        );
        self.join_member(instance_id, peer);
        debug!(instance_id, peer, "peer joined");
        self.send_to(peer, Command::Join, doc);
        Ok(())
    }

    fn on_update(&self, peer: u64, initiator: &str, mut task: Value) -> SyncResult<()> {
        let instance_id = task
            .get("instanceId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Protocol("update without instanceId".to_string()))?;
        let node = task
            .as_object_mut()
            .and_then(|m| m.remove("node"))
            .unwrap_or_else(|| json!({}));
        let request = LockRequest::from_value(node.get("commandArgs"));
        let now = now_millis() as i64;

        // The entry guard serializes updates per instance, fan-out included.
        let Some(mut doc) = self.docs.get_mut(&instance_id) else {
            self.reply_error(peer, Some(&instance_id), None, "unknown instance");
            return Ok(());
        };
        let holder = lock_holder(&doc).map(str::to_string);
        let updated_at = lookup(&doc, "meta.updatedAt").and_then(Value::as_i64);
        let next_holder = match arbitrate(&instance_id, holder.as_deref(), updated_at, request, initiator, now) {
            Ok(next) => next,
            Err(e @ SyncError::LockConflict { .. }) => {
                warn!(instance_id = %instance_id, node_id = %initiator, error = %e, "update refused");
                drop(doc);
                self.reply_error(peer, Some(&instance_id), None, &format!("Task locked: {}", e));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut lock_ops = Patch::new().set("meta.updatedAt", Value::from(now));
        match (&next_holder, &holder) {
            (Some(h), _) => lock_ops = lock_ops.set("meta.locked", Value::String(h.clone())),
            (None, Some(_)) => lock_ops = lock_ops.delete("meta.locked"),
            (None, None) => {}
        }
        let patch = Patch::from_value(&task)?.compose(&lock_ops);
        *doc = patch.apply(&doc);
        if holder != next_holder {
            info!(instance_id = %instance_id, from = ?holder, to = ?next_holder, "lock changed");
        }

        let mut outgoing = patch.to_value();
        set_path(&mut outgoing, "node", node);
        set_path(&mut outgoing, "node.sourceNodeId", Value::String(initiator.to_string()));
        self.join_member(&instance_id, peer);
        let delivered = self.fan_out(&instance_id, None, Command::Update, &outgoing);
        debug!(instance_id = %instance_id, source = %initiator, delivered, "update relayed");
        Ok(())
    }

    fn on_partial(&self, peer: u64, initiator: &str, mut task: Value) -> SyncResult<()> {
        let instance_id = task
            .get("instanceId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Protocol("partial without instanceId".to_string()))?;
        set_path(&mut task, "node.sourceNodeId", Value::String(initiator.to_string()));
        self.fan_out(&instance_id, Some(peer), Command::Partial, &task);
        Ok(())
    }

    fn join_member(&self, instance_id: &str, peer: u64) {
        self.members.entry(instance_id.to_string()).or_default().insert(peer);
    }

    fn fan_out(&self, instance_id: &str, except: Option<u64>, command: Command, task: &Value) -> usize {
        let Some(members) = self.members.get(instance_id).map(|m| m.clone()) else {
            return 0;
        };
        let mut delivered = 0;
        let mut sorted: Vec<u64> = members.into_iter().filter(|p| Some(*p) != except).collect();
        sorted.sort_unstable();
        for peer in sorted {
            if self.send_to(peer, command, task.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn reply_error(&self, peer: u64, instance_id: Option<&str>, correlation: Option<String>, message: &str) {
        let mut task = json!({ "error": message });
        if let Some(id) = instance_id {
            set_path(&mut task, "instanceId", Value::String(id.to_string()));
        }
        if let Some(correlation) = correlation {
            set_path(&mut task, "meta.prevInstanceId", Value::String(correlation));
        }
        self.send_to(peer, Command::Error, task);
    }

    fn send_to(&self, peer: u64, command: Command, task: Value) -> bool {
        let mut envelope = Envelope::new(task);
        envelope.stamp(command, None);
        let raw = match envelope.encode() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(peer, error = %e, "encode failed");
                return false;
            }
        };
        match self.peers.get(&peer) {
            Some(p) => p.tx.send(raw).is_ok(),
            None => false,
        }
    }
}
