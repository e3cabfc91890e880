use clap::{Parser, Subcommand};
use tasksync::channel::{Channel, WebSocketConnector};
use tasksync::config::{load_config, NodeConfig};
use tasksync::hub_api::{HubClient, Registration};
use tasksync::machine::BehaviorRegistry;
use tasksync::relay::{load_templates, server, Relay};
use tasksync::router::CommandRouter;
use tasksync::runtime::{NodeEvent, StartRequest, SyncNode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Result;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a processing node connected to a hub
    Node {
        /// Path to the node YAML config
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Overrides `node_id` from the config
        #[arg(long)]
        node_id: Option<String>,

        /// Overrides `hub.ws_url` from the config
        #[arg(long)]
        hub_url: Option<String>,

        /// Definition id of a root task to start once connected
        #[arg(long)]
        start: Option<String>,

        /// Input for the started task (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        input: Vec<(String, Value)>,
    },

    /// Run an in-memory relay that stands in for the hub
    Relay {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:5000")]
        listen: String,

        /// YAML file of task definition templates
        #[arg(long)]
        definitions: Option<PathBuf>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // JSON if it parses, plain string otherwise
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Node { config, node_id, hub_url, start, input } => {
            let mut cfg = match config {
                Some(path) => load_config(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(id) = node_id {
                cfg.node_id = id;
            }
            if let Some(url) = hub_url {
                cfg.hub.ws_url = url;
            }
            run_node(cfg, start, input.into_iter().collect()).await
        }
        Commands::Relay { listen, definitions } => {
            let templates = match definitions {
                Some(path) => load_templates(&path)?,
                None => HashMap::new(),
            };
            info!(definitions = templates.len(), "starting relay");
            server::serve(Relay::new(templates), &listen).await
        }
    }
}

async fn run_node(cfg: NodeConfig, start: Option<String>, input: Map<String, Value>) -> Result<()> {
    info!(node_id = %cfg.node_id, hub = %cfg.hub.ws_url, "starting node");

    if let Some(api_url) = &cfg.hub.api_url {
        let registration = Registration {
            environment: cfg.environment.clone(),
            language: cfg.language.clone(),
            processing_mode: cfg.processing_mode.clone(),
            ..Registration::new(cfg.node_id.clone())
        };
        let registered = HubClient::new(api_url).register(&registration).await?;
        info!(hub_id = %registered.hub_id, config_hash = ?registered.config_hash, "registered with hub");
    }

    let mut registry = BehaviorRegistry::new();
    if let Some(dir) = &cfg.machines_dir {
        let loaded = registry.load_tables(dir)?;
        info!(loaded, dir = %dir.display(), "machine tables loaded");
    }

    let store = cfg.open_store()?;
    let router = Arc::new(CommandRouter::new());
    let (channel, channel_events, channel_task) = Channel::spawn(
        Arc::new(WebSocketConnector),
        cfg.hub.ws_url.clone(),
        cfg.node_id.clone(),
        cfg.reconnect_policy(),
        cfg.heartbeat(),
        router.clone(),
    );
    let (node, events) = SyncNode::new(
        cfg.node_id.clone(),
        router,
        Arc::new(channel.clone()),
        store,
        registry,
        cfg.mount_timeout(),
    );
    node.watch_channel(channel_events);

    let (start_tx, mut start_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(report(events, start.is_some().then_some(start_tx)));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        first = start_rx.recv(), if start.is_some() => {
            if let (Some(_), Some(definition)) = (first, start) {
                let request = StartRequest::new(definition).with_input(input);
                match node.start_task(request).await {
                    Ok(handle) => info!(instance_id = %handle.instance_id(), "root task started"),
                    Err(e) => error!(error = %e, "root task failed to start"),
                }
            }
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupted");
        }
    }

    channel.close();
    let _ = channel_task.await;
    Ok(())
}

/// Logs node events; signals `connected` on the first connect.
async fn report(mut events: mpsc::UnboundedReceiver<NodeEvent>, mut connected: Option<mpsc::UnboundedSender<()>>) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::Connected => {
                info!("connected to hub");
                if let Some(tx) = connected.take() {
                    let _ = tx.send(());
                }
            }
            NodeEvent::Disconnected => warn!("disconnected from hub"),
            NodeEvent::Reloaded { rejoined } => warn!(rejoined, "state reloaded from hub"),
            NodeEvent::GaveUp => error!("hub unreachable, giving up"),
            NodeEvent::RemoteError { instance_id, message } => {
                warn!(?instance_id, %message, "remote error")
            }
            NodeEvent::InstanceFailed { instance_id, error } => {
                error!(%instance_id, %error, "instance failed")
            }
            NodeEvent::Completed { instance_id } => info!(%instance_id, "instance completed"),
            other => info!(event = ?other, "node event"),
        }
    }
}
