use std::sync::Arc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use crate::error::SyncResult;
use crate::runtime::storage::ReplicaStore;
use crate::sync::diff::{Patch, PatchOp};
use crate::sync::integrity::{self, Integrity};
use crate::sync::lock::{lock_holder, LockRequest};
use crate::task::{lookup, set_path};

/// This node's relationship to an incoming update, checked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `commandArgs.sync`: targeted fields are replaced wholesale.
    Sync,
    /// Echo of a command this node sent: only `meta`/`node` are taken.
    Source,
    /// This node holds the lock: everything but `input` is taken.
    LockHolder,
    Bystander,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub role: Role,
    pub integrity: Integrity,
    /// New stored snapshot (already persisted).
    pub stored: Value,
    /// New live document.
    pub live: Value,
    /// The patch that was applied to the live document.
    pub applied: Patch,
    /// The echo confirmed this node's pending command.
    pub confirmed: bool,
}

/// Merges `update` diffs into the replica store and decides what reaches
/// the live document.
pub struct Reconciler {
    node_id: String,
    store: Arc<dyn ReplicaStore>,
    // (instanceId, sourceNodeId) -> last applied messageId
    applied: DashMap<(String, String), u64>,
}

impl Reconciler {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn ReplicaStore>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            applied: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.store
    }

    /// Classifies `update` against the snapshot it was merged into.
    pub fn classify(&self, update: &Value, merged: &Value) -> Role {
        if flag(update, "node.commandArgs.sync") {
            return Role::Sync;
        }
        if lookup(update, "node.sourceNodeId").and_then(Value::as_str) == Some(self.node_id.as_str()) {
            return Role::Source;
        }
        if lock_holder(merged) == Some(self.node_id.as_str()) {
            return Role::LockHolder;
        }
        Role::Bystander
    }

    /// Applies one `update` for `instance_id`. Returns `None` when the update
    /// is older than one already applied from the same source.
    pub async fn apply_update(
        &self,
        instance_id: &str,
        live: &Value,
        update: &Value,
    ) -> SyncResult<Option<Reconciled>> {
        let patch = Patch::from_value(update)?;
        let source = lookup(update, "node.sourceNodeId").and_then(Value::as_str);
        let message_id = lookup(update, "meta.messageId").and_then(Value::as_u64);

        let seen_key = source.map(|s| (instance_id.to_string(), s.to_string()));
        if let (Some(key), Some(id)) = (&seen_key, message_id) {
            if let Some(last) = self.applied.get(key) {
                if id <= *last {
                    debug!(instance_id, message_id = id, last = *last, "dropping stale update");
                    return Ok(None);
                }
            }
        }

        let stored = self
            .store
            .get(instance_id)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new()));

        let sync = flag(update, "node.commandArgs.sync");
        let integrity = if sync {
            Integrity::Unverifiable
        } else {
            let hash = lookup(update, "meta.hash").and_then(as_u32);
            let hash_diff = lookup(update, "meta.hashDiff").and_then(as_u32);
            let result = integrity::verify(&stored, &patch, hash, hash_diff);
            if result.is_diverged() {
                warn!(instance_id, ?source, "integrity mismatch on update");
            }
            result
        };

        let mut body = patch.without("node");
        if let Some(holder) = lock_holder(&stored) {
            let releases = matches!(
                body.get("meta"),
                Some(PatchOp::Merge(meta)) if matches!(meta.get("locked"), Some(PatchOp::Delete))
            );
            let request = LockRequest::from_value(lookup(update, "node.commandArgs"));
            if source != Some(holder) && !releases && !sync && !request.bypass {
                if body.get("output").is_some() || body.get("response").is_some() {
                    warn!(instance_id, holder, ?source, "ignoring output from a non-holder while locked");
                }
                body = body.without("output").without("response");
            }
        }

        let mut merged = body.apply(&stored);
        set_path(&mut merged, "node", update.get("node").cloned().unwrap_or(Value::Null));
        let hash = integrity::fingerprint(&merged);
        set_path(&mut merged, "meta.hash", Value::from(hash));
        self.store.set(instance_id, merged.clone()).await?;

        if let (Some(key), Some(id)) = (seen_key, message_id) {
            self.applied.insert(key, id);
        }

        let role = self.classify(update, &merged);
        let mut applied = match role {
            Role::Sync => body.wholesale(&merged),
            Role::Source => body.only(&["meta"]),
            Role::LockHolder => body.without("input"),
            Role::Bystander => body,
        };
        if let Some(node) = patch.get("node") {
            applied.insert("node", node.clone());
        }

        let pending = lookup(live, "node.commandPending").cloned();
        let mut next_live = applied.apply(live);
        let echoed = lookup(update, "node.command");
        let confirmed = source == Some(self.node_id.as_str())
            && pending.is_some()
            && pending.as_ref() == echoed;
        let keep = if confirmed { Value::Null } else { pending.unwrap_or(Value::Null) };
        set_path(&mut next_live, "node.commandPending", keep);

        debug!(instance_id, ?role, ?message_id, confirmed, "update reconciled");
        Ok(Some(Reconciled {
            role,
            integrity,
            stored: merged,
            live: next_live,
            applied,
            confirmed,
        }))
    }

    /// Forgets stale-update bookkeeping for an evicted instance.
    pub fn forget(&self, instance_id: &str) {
        self.applied.retain(|(id, _), _| id != instance_id);
    }
}

fn flag(doc: &Value, path: &str) -> bool {
    lookup(doc, path).and_then(Value::as_bool).unwrap_or(false)
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}
