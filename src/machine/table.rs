use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use async_trait::async_trait;
use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
    Node as EvalNode,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use crate::machine::{StepContext, TaskBehavior};
use crate::task::{Command, CommandArgs};

/// YAML form of a transition table.
///
/// ```yaml
/// id: root.chat
/// initial: start
/// states:
///   start:
///     - next: input
///   input:
///     - when: 'input.promptText != ""'
///       command: update
///       next: waiting
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TableDefinition {
    pub id: String,
    pub initial: String,
    #[serde(default)]
    pub reset_on_mount: bool,
    pub states: BTreeMap<String, Vec<RuleDefinition>>,
}

/// Rules are tried in order; the first that applies fires and ends the step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDefinition {
    /// evalexpr guard over the flattened document (`input.promptText`, ...)
    /// plus `is_locked`, `holds_lock`, `transition`, `partial_text` and
    /// `partial_final`. Unknown identifiers make the guard false.
    #[serde(default)]
    pub when: Option<String>,
    /// Only fire on the first run after entering the state.
    #[serde(default)]
    pub on_entry: bool,
    /// Dotted path -> value; `null` deletes.
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    #[serde(default)]
    pub command: Option<Command>,
    #[serde(default)]
    pub lock: bool,
    #[serde(default)]
    pub unlock: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug)]
struct Rule {
    guard: Option<EvalNode>,
    raw_guard: String,
    on_entry: bool,
    set: Vec<(String, Value)>,
    command: Option<Command>,
    args: CommandArgs,
    description: Option<String>,
    next: Option<String>,
    done: bool,
}

/// Declarative behavior compiled from a [`TableDefinition`].
#[derive(Debug)]
pub struct TableBehavior {
    id: String,
    initial: String,
    reset_on_mount: bool,
    states: HashMap<String, Vec<Rule>>,
}

impl TableBehavior {
    pub fn compile(def: TableDefinition) -> Result<Self> {
        if !def.states.contains_key(&def.initial) {
            bail!("{}: initial state '{}' is not declared", def.id, def.initial);
        }
        let mut states = HashMap::new();
        for (name, rules) in &def.states {
            let mut compiled = Vec::with_capacity(rules.len());
            for rule in rules {
                if let Some(next) = &rule.next {
                    if !def.states.contains_key(next) {
                        bail!("{}: state '{}' moves to undeclared state '{}'", def.id, name, next);
                    }
                }
                let raw_guard = rule.when.clone().unwrap_or_default();
                let guard = match &rule.when {
                    Some(expr) => Some(
                        build_operator_tree(expr)
                            .map_err(|e| anyhow!("{}: bad guard '{}': {}", def.id, expr, e))?,
                    ),
                    None => None,
                };
                compiled.push(Rule {
                    guard,
                    raw_guard,
                    on_entry: rule.on_entry,
                    set: rule.set.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    command: rule.command,
                    args: CommandArgs {
                        lock: rule.lock,
                        unlock: rule.unlock,
                        ..Default::default()
                    },
                    description: rule.description.clone(),
                    next: rule.next.clone(),
                    done: rule.done,
                });
            }
            states.insert(name.clone(), compiled);
        }
        Ok(Self {
            id: def.id,
            initial: def.initial,
            reset_on_mount: def.reset_on_mount,
            states,
        })
    }

    fn eval_context(ctx: &StepContext<'_>) -> HashMapContext<DefaultNumericTypes> {
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        flatten("", ctx.doc(), &mut eval_ctx);
        let flags = [
            ("is_locked", ctx.is_locked()),
            ("holds_lock", ctx.holds_lock()),
            ("transition", ctx.transition()),
            ("partial_final", ctx.partial_final()),
        ];
        for (name, flag) in flags {
            let _ = eval_ctx.set_value(name.to_string(), evalexpr::Value::Boolean(flag));
        }
        let _ = eval_ctx.set_value(
            "partial_text".to_string(),
            evalexpr::Value::String(ctx.partial_text().to_string()),
        );
        eval_ctx
    }
}

fn flatten(prefix: &str, value: &Value, eval_ctx: &mut HashMapContext<DefaultNumericTypes>) {
    if let Value::Object(map) = value {
        for (k, v) in map {
            let key = if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) };
            flatten(&key, v, eval_ctx);
        }
        return;
    }
    let eval_val = match value {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() { Some(evalexpr::Value::Int(i)) }
            else if let Some(f) = n.as_f64() { Some(evalexpr::Value::Float(f)) }
            else { None }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        _ => None,
    };
    if let Some(ev) = eval_val {
        let _ = eval_ctx.set_value(prefix.to_string(), ev);
    }
}

#[async_trait]
impl TaskBehavior for TableBehavior {
    fn name(&self) -> &str {
        &self.id
    }

    fn initial_state(&self) -> &str {
        &self.initial
    }

    fn declares(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    fn reset_on_mount(&self) -> bool {
        self.reset_on_mount
    }

    async fn step(&self, ctx: &mut StepContext<'_>) -> Result<Option<String>> {
        let Some(state) = ctx.state().map(str::to_string) else {
            return Ok(None);
        };
        let rules = self
            .states
            .get(&state)
            .ok_or_else(|| anyhow!("{}: no rules for state '{}'", self.id, state))?;
        let eval_ctx = Self::eval_context(ctx);

        for rule in rules {
            if rule.on_entry && !ctx.transition_to(&state) {
                continue;
            }
            if let Some(guard) = &rule.guard {
                match guard.eval_boolean_with_context(&eval_ctx) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        debug!(definition = %self.id, guard = %rule.raw_guard, error = %e, "guard not satisfied");
                        continue;
                    }
                }
            }
            for (path, value) in &rule.set {
                ctx.modify(path, value.clone());
            }
            if rule.done {
                ctx.finish();
            }
            if let Some(command) = rule.command {
                ctx.send(command, rule.args.clone(), rule.description.as_deref());
            }
            return Ok(rule.next.clone());
        }
        Ok(None)
    }
}

pub fn load_table_from_yaml(file_path: &Path) -> Result<TableBehavior> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read machine table from {}", file_path.display()))?;

    let definition: TableDefinition = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize machine table from {}", file_path.display()))?;

    TableBehavior::compile(definition)
        .with_context(|| format!("Invalid machine table in {}", file_path.display()))
}
