use std::sync::Arc;
use anyhow::{Context as AnyhowContext, Result};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{info, warn};
use crate::channel::websocket::pump;
use crate::relay::Relay;

/// Accepts WebSocket peers on `listen` until the listener fails.
pub async fn serve(relay: Arc<Relay>, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", listen))?;
    info!(addr = %listen, hub_id = %relay.hub_id(), "relay listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws_stream) => {
                    info!(%peer_addr, "peer connected");
                    let served = relay.attach(pump(ws_stream));
                    let _ = served.await;
                    info!(%peer_addr, "peer disconnected");
                }
                Err(e) => warn!(%peer_addr, error = %e, "websocket handshake failed"),
            }
        });
    }
}
