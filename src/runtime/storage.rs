use async_trait::async_trait;
use serde_json::Value;
use anyhow::Result;
use dashmap::DashMap;

/// 本地副本存储 (Local Replica Store)
/// Last-applied full snapshot per instance, used as the base for diffs.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    async fn get(&self, instance_id: &str) -> Result<Option<Value>>;
    async fn set(&self, instance_id: &str, doc: Value) -> Result<()>;
    async fn remove(&self, instance_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryReplicaStore {
    docs: DashMap<String, Value>,
}

impl InMemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn get(&self, instance_id: &str) -> Result<Option<Value>> {
        Ok(self.docs.get(instance_id).map(|doc| doc.value().clone()))
    }

    async fn set(&self, instance_id: &str, doc: Value) -> Result<()> {
        self.docs.insert(instance_id.to_string(), doc);
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        self.docs.remove(instance_id);
        Ok(())
    }
}
