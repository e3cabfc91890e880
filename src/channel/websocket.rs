use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::debug;
use crate::channel::{Connector, Link};

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<Link> {
        let (ws_stream, _) = connect_async(url).await?;
        Ok(pump(ws_stream))
    }
}

/// Splits a socket into a [`Link`]: one task forwards outgoing frames, one
/// forwards incoming text until the peer closes.
pub fn pump<S>(ws_stream: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx_out, mut rx_out) = mpsc::unbounded_channel::<String>();
    let (tx_in, rx_in) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(text) = rx_out.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!("dropping non-utf8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) | Err(_) => break,
                // Ping/Pong frames are answered by tungstenite itself
                _ => continue,
            };
            if tx_in.send(text).is_err() {
                break;
            }
        }
    });

    Link {
        outgoing: tx_out,
        incoming: rx_in,
    }
}
