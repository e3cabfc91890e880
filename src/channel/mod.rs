use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, trace, warn};
use crate::error::{SyncError, SyncResult};
use crate::router::CommandRouter;
use crate::task::{lookup, set_path, Command, Envelope};

pub mod backoff;
pub mod memory;
pub mod sequencer;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use memory::MemoryConnector;
pub use sequencer::MessageSequencer;
pub use websocket::WebSocketConnector;

/// One open duplex connection, as text frames.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Two connected ends, for in-process transports.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link { outgoing: a_tx, incoming: b_rx },
            Link { outgoing: b_tx, incoming: a_rx },
        )
    }
}

/// 传输连接器 (Transport Connector)
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<Link>;

    /// Out-of-band reachability check used once reconnects are exhausted.
    async fn probe(&self, url: &str) -> anyhow::Result<()> {
        self.connect(url).await.map(drop)
    }
}

/// Lifecycle notifications. `Connected` is only emitted once a link is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    /// Reconnects were exhausted and a probe later succeeded; local state
    /// must be reloaded from the hub.
    ReloadRequired,
    GaveUp,
}

/// Where task actors send commands.
pub trait Outbound: Send + Sync {
    /// Sends `task` as `command`, returning the assigned message id.
    fn send(&self, command: Command, task: Value) -> SyncResult<u64>;
}

struct Shared {
    node_id: String,
    link: parking_lot::RwLock<Option<mpsc::UnboundedSender<String>>>,
    sequencer: MessageSequencer,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn send(&self, command: Command, mut task: Value) -> SyncResult<u64> {
        let message_id = self.sequencer.next();
        let prev = lookup(&task, "meta.messageId").cloned().unwrap_or(Value::Null);
        set_path(&mut task, "meta.prevMessageId", prev);
        set_path(&mut task, "meta.messageId", Value::from(message_id));

        let mut envelope = Envelope::new(task);
        envelope.stamp(command, Some(&self.node_id));
        let raw = envelope.encode()?;

        let guard = self.link.read();
        let tx = guard
            .as_ref()
            .ok_or_else(|| SyncError::Transport("channel is not connected".to_string()))?;
        tx.send(raw)
            .map_err(|_| SyncError::Transport("link closed".to_string()))?;

        if matches!(command, Command::Ping) {
            trace!(message_id, "ping");
        } else {
            debug!(%command, message_id, "sent");
        }
        Ok(message_id)
    }
}

/// Cloneable sending side of a [`Channel`].
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.read().is_some()
    }

    /// Stops the connection loop.
    pub fn close(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Outbound for ChannelHandle {
    fn send(&self, command: Command, task: Value) -> SyncResult<u64> {
        self.shared.send(command, task)
    }
}

/// Reconnecting message channel. Inbound frames go straight to the router;
/// lifecycle changes are reported as [`ChannelEvent`]s.
pub struct Channel {
    connector: Arc<dyn Connector>,
    url: String,
    policy: ReconnectPolicy,
    heartbeat: Duration,
    router: Arc<CommandRouter>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Channel {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        node_id: impl Into<String>,
        policy: ReconnectPolicy,
        heartbeat: Duration,
        router: Arc<CommandRouter>,
    ) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            node_id: node_id.into(),
            link: parking_lot::RwLock::new(None),
            sequencer: MessageSequencer::new(),
            shutdown: shutdown_tx,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Channel {
            connector,
            url: url.into(),
            policy,
            heartbeat,
            router,
            shared: shared.clone(),
            events: events_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(channel.run());
        (ChannelHandle { shared }, events_rx, task)
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        loop {
            if !self.connect_with_backoff().await {
                return;
            }
            // Reconnects exhausted.
            if self.probe().await {
                info!(url = %self.url, "hub reachable again, forcing reload");
                self.emit(ChannelEvent::ReloadRequired);
            } else {
                error!(url = %self.url, "hub unreachable, giving up");
                self.emit(ChannelEvent::GaveUp);
                return;
            }
        }
    }

    /// Connects, serves, and reconnects until the attempts run out.
    /// Returns false when the channel was closed.
    async fn connect_with_backoff(&mut self) -> bool {
        let mut attempt = 0u32;
        loop {
            if self.stopped() {
                return false;
            }
            match self.connector.connect(&self.url).await {
                Ok(link) => {
                    if attempt > 0 {
                        info!(attempt, "reconnected");
                    }
                    attempt = 0;
                    let closed = self.serve(link).await;
                    self.emit(ChannelEvent::Disconnected);
                    if closed {
                        return false;
                    }
                    warn!(url = %self.url, "channel disconnected");
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, error = %e, "connect failed");
                }
            }
            if attempt >= self.policy.max_attempts {
                return true;
            }
            let delay = self.policy.delay(attempt);
            attempt += 1;
            if self.sleep_or_stop(delay).await {
                return false;
            }
        }
    }

    async fn probe(&mut self) -> bool {
        for attempt in 0..self.policy.probe_attempts {
            if self.sleep_or_stop(self.policy.delay(attempt)).await {
                return false;
            }
            match self.connector.probe(&self.url).await {
                Ok(()) => return true,
                Err(e) => debug!(attempt, error = %e, "probe failed"),
            }
        }
        false
    }

    /// Returns true if the channel was closed while waiting.
    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => self.stopped(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }

    /// Pumps one link until it drops. Returns true if closed locally.
    async fn serve(&mut self, link: Link) -> bool {
        let Link { outgoing, mut incoming } = link;
        *self.shared.link.write() = Some(outgoing);
        info!(url = %self.url, "channel connected");
        self.emit(ChannelEvent::Connected);

        // First tick fires immediately: ping on open.
        let mut heartbeat = interval(self.heartbeat);
        let closed = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.shared.send(Command::Ping, json!({})) {
                        debug!(error = %e, "heartbeat failed");
                        break false;
                    }
                }
                frame = incoming.recv() => match frame {
                    Some(raw) => {
                        if let Err(e) = self.router.dispatch_raw(&raw) {
                            warn!(error = %e, "dropping malformed frame");
                        }
                    }
                    None => break false,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break true;
                    }
                }
            }
        };
        *self.shared.link.write() = None;
        closed
    }
}
