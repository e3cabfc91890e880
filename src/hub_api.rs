use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use crate::error::{SyncError, SyncResult};
use crate::task::Command;

/// Body of `POST {api}/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub node_id: String,
    pub commands_accepted: Vec<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_mode: Option<String>,
}

impl Registration {
    /// A node that accepts every task command.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            commands_accepted: vec![
                Command::Init,
                Command::Join,
                Command::Update,
                Command::Partial,
                Command::Error,
            ],
            environment: None,
            language: None,
            processing_mode: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub hub_id: String,
    #[serde(default)]
    pub config_hash: Option<String>,
}

/// Hub REST endpoints used before the socket comes up.
#[derive(Debug, Clone)]
pub struct HubClient {
    client: Client,
    base_url: String,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    pub async fn register(&self, registration: &Registration) -> SyncResult<RegisterResponse> {
        let response = self
            .client
            .post(self.url("register"))
            .json(registration)
            .send()
            .await?
            .error_for_status()?;
        let body: RegisterResponse = response.json().await?;
        info!(node_id = %registration.node_id, hub_id = %body.hub_id, "node registered");
        Ok(body)
    }

    /// Resolves the user behind a processor session.
    pub async fn session(&self, processor_id: &str) -> SyncResult<Value> {
        let response = self
            .client
            .post(self.url("session"))
            .json(&json!({ "processorId": processor_id }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.get("user")
            .cloned()
            .ok_or_else(|| SyncError::Protocol("session response has no user".to_string()))
    }
}
