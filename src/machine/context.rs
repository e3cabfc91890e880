use serde_json::{Map, Value};
use crate::machine::partial::PartialAccumulator;
use crate::machine::state::StateTracker;
use crate::sync::diff::Patch;
use crate::sync::lock;
use crate::task::{lookup, Command, CommandArgs, Task};

/// A command the handler wants sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub command: Command,
    pub args: CommandArgs,
    pub description: Option<String>,
}

/// A child instance to start once this step is done.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub id: String,
    pub input: Map<String, Value>,
}

/// Everything a handler run asked for.
#[derive(Debug, Clone, Default)]
pub struct Effects {
    pub patch: Patch,
    pub intent: Option<Intent>,
    pub children: Vec<ChildSpec>,
}

/// 步骤上下文 (Step Context)
/// Read access to the live document plus a buffer of requested changes,
/// applied by the actor after the handler returns.
pub struct StepContext<'a> {
    task: &'a Task,
    doc: Value,
    node_id: &'a str,
    tracker: &'a StateTracker,
    partial: &'a PartialAccumulator,
    effects: Effects,
}

impl<'a> StepContext<'a> {
    pub fn new(
        task: &'a Task,
        node_id: &'a str,
        tracker: &'a StateTracker,
        partial: &'a PartialAccumulator,
    ) -> Self {
        let doc = serde_json::to_value(task).unwrap_or(Value::Null);
        Self {
            task,
            doc,
            node_id,
            tracker,
            partial,
            effects: Effects::default(),
        }
    }

    pub fn task(&self) -> &Task {
        self.task
    }

    /// The live document as JSON.
    pub fn doc(&self) -> &Value {
        &self.doc
    }

    /// Dotted lookup into the live document.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.doc, path)
    }

    pub fn node_id(&self) -> &str {
        self.node_id
    }

    pub fn state(&self) -> Option<&str> {
        self.task.current_state()
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.task.input.get(key)
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.task.output.get(key)
    }

    pub fn transition(&self) -> bool {
        self.tracker.transition(self.state())
    }

    pub fn transition_to(&self, state: &str) -> bool {
        self.tracker.transition_to(self.state(), state)
    }

    pub fn transition_from(&self, state: &str) -> bool {
        self.tracker.transition_from(self.state(), state)
    }

    /// Locked by another node.
    pub fn is_locked(&self) -> bool {
        lock::is_locked(self.task, self.node_id)
    }

    pub fn holds_lock(&self) -> bool {
        self.task.locked_by() == Some(self.node_id)
    }

    pub fn partial_text(&self) -> &str {
        self.partial.text()
    }

    pub fn partial_final(&self) -> bool {
        self.partial.is_final()
    }

    /// Sets a dotted path on the live document.
    pub fn modify(&mut self, path: &str, value: Value) {
        let patch = std::mem::take(&mut self.effects.patch);
        self.effects.patch = patch.set(path, value);
    }

    pub fn remove(&mut self, path: &str) {
        let patch = std::mem::take(&mut self.effects.patch);
        self.effects.patch = patch.delete(path);
    }

    pub fn finish(&mut self) {
        self.modify("state.done", Value::Bool(true));
    }

    pub fn send(&mut self, command: Command, args: CommandArgs, description: Option<&str>) {
        self.effects.intent = Some(Intent {
            command,
            args,
            description: description.map(str::to_string),
        });
    }

    pub fn send_update(&mut self, args: CommandArgs) {
        self.send(Command::Update, args, None);
    }

    pub fn start_child(&mut self, id: &str, input: Map<String, Value>) {
        self.effects.children.push(ChildSpec {
            id: id.to_string(),
            input,
        });
    }

    pub fn into_effects(self) -> Effects {
        self.effects
    }
}
