use async_trait::async_trait;
use serde_json::Value;
use crate::runtime::storage::ReplicaStore;
use anyhow::Result;
use redis::AsyncCommands;

/// Replica store backed by Redis, one JSON string per instance.
pub struct RedisReplicaStore {
    client: redis::Client,
    prefix: String,
    node_id: String,
}

impl RedisReplicaStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            node_id: node_id.into(),
        }
    }

    pub fn open(url: &str, prefix: impl Into<String>, node_id: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client, prefix, node_id))
    }

    fn task_key(&self, instance_id: &str) -> String {
        format!("{}:{}:task:{}", self.prefix, self.node_id, instance_id)
    }
}

#[async_trait]
impl ReplicaStore for RedisReplicaStore {
    async fn get(&self, instance_id: &str) -> Result<Option<Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.task_key(instance_id)).await?;

        if let Some(s) = raw {
            let doc: Value = serde_json::from_str(&s)?;
            Ok(Some(doc))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, instance_id: &str, doc: Value) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&doc)?;
        let _: () = conn.set(self.task_key(instance_id), serialized).await?;
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.task_key(instance_id)).await?;
        Ok(())
    }
}
