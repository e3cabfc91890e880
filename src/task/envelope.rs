use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::{SyncError, SyncResult};
use crate::task::{lookup, set_path, Command};

/// `{"task": {...}}`, the only frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub task: Value,
}

impl Envelope {
    pub fn new(task: Value) -> Self {
        Self { task }
    }

    pub fn decode(raw: &str) -> SyncResult<Self> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        if !envelope.task.is_object() {
            return Err(SyncError::Protocol("task must be an object".to_string()));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn command(&self) -> Option<Command> {
        lookup(&self.task, "node.command")
            .and_then(Value::as_str)
            .and_then(Command::parse)
    }

    /// Writes `node.command` (and optionally `node.id`) into the task.
    pub fn stamp(&mut self, command: Command, node_id: Option<&str>) {
        set_path(&mut self.task, "node.command", Value::String(command.as_str().to_string()));
        if let Some(id) = node_id {
            set_path(&mut self.task, "node.id", Value::String(id.to_string()));
        }
    }
}

/// A decoded inbound message, tagged with its enqueue sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub seq: u64,
    pub command: Command,
    pub task: Value,
}

impl InboundMessage {
    fn str_at(&self, path: &str) -> Option<&str> {
        lookup(&self.task, path).and_then(Value::as_str)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.str_at("instanceId")
    }

    /// Instance (or request) that asked for this message, for `init`/`join`
    /// and `error` replies.
    pub fn prev_instance_id(&self) -> Option<&str> {
        self.str_at("meta.prevInstanceId")
            .or_else(|| self.str_at("node.commandArgs.prevInstanceId"))
    }

    pub fn parent_instance_id(&self) -> Option<&str> {
        self.str_at("meta.parentInstanceId")
            .or_else(|| self.str_at("node.commandArgs.parentInstanceId"))
    }

    pub fn source_node_id(&self) -> Option<&str> {
        self.str_at("node.sourceNodeId")
    }

    pub fn message_id(&self) -> Option<u64> {
        lookup(&self.task, "meta.messageId").and_then(Value::as_u64)
    }

    /// Human readable error text carried by an `error` message.
    pub fn error_text(&self) -> String {
        self.str_at("error")
            .or_else(|| self.str_at("response.error"))
            .unwrap_or("unspecified remote error")
            .to_string()
    }
}
