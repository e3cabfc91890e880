use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use crate::error::{SyncError, SyncResult};

pub mod context;
pub mod partial;
pub mod state;
pub mod table;

pub use context::{ChildSpec, Effects, Intent, StepContext};
pub use partial::{PartialAccumulator, PartialChunk, PartialMode};
pub use state::StateTracker;
pub use table::{load_table_from_yaml, TableBehavior};

/// 任务行为接口 (Task Behavior)
/// A finite set of named states and a handler that switches on the current
/// one. Behaviors are shared between instances; per-instance state lives in
/// the [`StepContext`].
#[async_trait]
pub trait TaskBehavior: Send + Sync {
    /// Definition id this behavior serves, e.g. `root.chat`.
    fn name(&self) -> &str;

    fn initial_state(&self) -> &str;

    fn declares(&self, state: &str) -> bool;

    /// Reset `state.current` to the initial state whenever an instance is
    /// mounted on this node.
    fn reset_on_mount(&self) -> bool {
        false
    }

    /// Runs the handler for the current state and returns the next state,
    /// if any.
    async fn step(&self, ctx: &mut StepContext<'_>) -> Result<Option<String>>;
}

/// Definition id -> behavior, resolved when an instance mounts.
#[derive(Default, Clone)]
pub struct BehaviorRegistry {
    behaviors: HashMap<String, Arc<dyn TaskBehavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, behavior: Arc<dyn TaskBehavior>) {
        self.behaviors.insert(behavior.name().to_string(), behavior);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TaskBehavior>> {
        self.behaviors.get(id).cloned()
    }

    pub fn resolve(&self, id: &str) -> SyncResult<Arc<dyn TaskBehavior>> {
        self.get(id).ok_or_else(|| SyncError::UnknownBehavior(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    /// Registers every `*.yaml`/`*.yml` transition table in `dir`.
    pub fn load_tables(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
            .collect();
        paths.sort();
        for path in paths {
            let table = load_table_from_yaml(&path)?;
            tracing::info!(definition = %table.name(), path = %path.display(), "loaded machine table");
            self.register(Arc::new(table));
            loaded += 1;
        }
        Ok(loaded)
    }
}
