use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context as AnyhowContext, Result};
use serde::Deserialize;
use uuid::Uuid;
use crate::channel::ReconnectPolicy;
use crate::runtime::{InMemoryReplicaStore, RedisReplicaStore, ReplicaStore};

/// 节点配置 (Node Configuration)
///
/// ```yaml
/// node_id: worker-1
/// hub:
///   ws_url: ws://127.0.0.1:5000/ws
///   api_url: http://127.0.0.1:5000/api
/// storage:
///   kind: redis
///   url: redis://127.0.0.1:6379/0
/// machines_dir: machines
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub hub: HubConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat_secs: u64,
    pub mount_timeout_secs: u64,
    pub storage: StorageConfig,
    pub machines_dir: Option<PathBuf>,
    pub environment: Option<String>,
    pub language: Option<String>,
    pub processing_mode: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::new_v4()),
            hub: HubConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat_secs: 30,
            mount_timeout_secs: 10,
            storage: StorageConfig::default(),
            machines_dir: None,
            environment: None,
            language: None,
            processing_mode: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub ws_url: String,
    /// REST base for registration; skipped when absent.
    pub api_url: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:5000/ws".to_string(),
            api_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub factor: u32,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub probe_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            base_ms: policy.base.as_millis() as u64,
            factor: policy.factor,
            cap_ms: policy.cap.as_millis() as u64,
            max_attempts: policy.max_attempts,
            probe_attempts: policy.probe_attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Redis {
        url: String,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

fn default_prefix() -> String {
    "tasksync".to_string()
}

impl NodeConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect.base_ms),
            factor: self.reconnect.factor,
            cap: Duration::from_millis(self.reconnect.cap_ms),
            max_attempts: self.reconnect.max_attempts,
            probe_attempts: self.reconnect.probe_attempts,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn open_store(&self) -> Result<Arc<dyn ReplicaStore>> {
        match &self.storage {
            StorageConfig::Memory => Ok(Arc::new(InMemoryReplicaStore::new())),
            StorageConfig::Redis { url, prefix } => {
                let store = RedisReplicaStore::open(url, prefix.clone(), self.node_id.clone())
                    .with_context(|| format!("Failed to open Redis store at {}", url))?;
                Ok(Arc::new(store))
            }
        }
    }
}

pub fn load_config(file_path: &Path) -> Result<NodeConfig> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config from {}", file_path.display()))?;

    let config: NodeConfig = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize config from {}", file_path.display()))?;

    Ok(config)
}
