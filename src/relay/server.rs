//! WebSocket front end of the relay.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::Relay;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::signaling::{decode, ClientMessage};

pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind).await?;
        info!(
            "Relay listening on ws://{} (max {} per room)",
            listener.local_addr()?,
            config.max_room_size
        );
        Ok(Self {
            listener,
            relay: Arc::new(Relay::new(config.max_room_size)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Accept loop; runs until the listener fails.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let relay = Arc::clone(&self.relay);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, relay).await {
                    error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, relay: Arc<Relay>) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
    let id = relay.connect(outbox).await;

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode {} for {}: {}", msg.event_name(), writer_id, e);
                    continue;
                }
            };
            if write.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Read from {} failed: {}", id, e);
                break;
            }
        };
        match decode::<ClientMessage>(&text) {
            Ok(msg) => relay.handle(&id, msg).await,
            Err(e) => warn!("Ignoring frame from {}: {}", id, e),
        }
    }

    relay.disconnect(&id).await;
    writer.abort();
    Ok(())
}
