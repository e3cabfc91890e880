use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::error::SyncResult;

pub mod envelope;

pub use envelope::{Envelope, InboundMessage};

/// Wire-level command vocabulary, carried in `task.node.command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Register,
    Login,
    Reload,
    Init,
    Join,
    Start,
    Update,
    Partial,
    Error,
    Ping,
    Pong,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Register => "register",
            Command::Login => "login",
            Command::Reload => "reload",
            Command::Init => "init",
            Command::Join => "join",
            Command::Start => "start",
            Command::Update => "update",
            Command::Partial => "partial",
            Command::Error => "error",
            Command::Ping => "ping",
            Command::Pong => "pong",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
}

/// Replication bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_diff: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_message_id: Option<u64>,
    /// Node currently authoritative for writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<String>,
    /// Milliseconds since the epoch, stamped by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub founder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Arguments travelling with a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandArgs {
    #[serde(default, skip_serializing_if = "is_false")]
    pub lock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unlock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub lock_bypass: bool,
    /// Replace the targeted top-level fields wholesale on every replica.
    #[serde(default, skip_serializing_if = "is_false")]
    pub sync: bool,
    /// Definition id for `start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Existing instance to rejoin on `start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandArgs {
    pub fn is_empty(&self) -> bool {
        *self == CommandArgs::default()
    }

    pub fn locking() -> Self {
        Self { lock: true, ..Default::default() }
    }

    pub fn unlocking() -> Self {
        Self { unlock: true, ..Default::default() }
    }
}

/// Control-plane fields. Rebuilt for every outbound message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeControl {
    /// Sending node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "CommandArgs::is_empty")]
    pub command_args: CommandArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_description: Option<String>,
    /// Set after sending an `update`, cleared when the echo comes back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_pending: Option<Command>,
    /// Originator of the command being relayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The replicated document.
///
/// The top-level `command`, `commandArgs` and `commandDescription` hold the
/// local one-shot intent; they move into `node` when the intent is sent and
/// are cleared right after.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub request: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub response: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub node: NodeControl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "CommandArgs::is_empty")]
    pub command_args: CommandArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn from_value(value: Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn current_state(&self) -> Option<&str> {
        self.state.current.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.state.done
    }

    pub fn locked_by(&self) -> Option<&str> {
        self.meta.locked.as_deref()
    }

    /// `config.familyTaskDiff`: publish outbound diffs to the family topic.
    pub fn publishes_family_diffs(&self) -> bool {
        self.config
            .get("familyTaskDiff")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Reads `path` (dotted) out of a JSON document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |cursor, segment| cursor.as_object()?.get(segment))
}

/// Writes `value` at `path` (dotted), creating intermediate objects and
/// replacing non-object intermediates. A `null` value removes the key.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else { return };
    let mut cursor = doc;
    for segment in segments {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else { return };
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        if value.is_null() {
            map.remove(leaf);
        } else {
            map.insert(leaf.to_string(), value);
        }
    }
}
