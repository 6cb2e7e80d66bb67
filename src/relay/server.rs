//! WebSocket Server für den Relay
//!
//! Pro Verbindung ein Handler-Task, der eingehende Nachrichten strikt
//! nacheinander an den [`Relay`] übergibt, und ein Write-Task, der die
//! Sende-Queue der Verbindung abarbeitet.

use super::presence::ConnectionHandle;
use super::router::{ConnectionContext, Relay};
use crate::config::RelayConfig;
use crate::signaling::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),
}

// ============================================================================
// RELAY SERVER
// ============================================================================

pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
    config: RelayConfig,
}

impl RelayServer {
    /// Bindet den Listener an die konfigurierte Adresse
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        tracing::info!("Relay listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            relay: Arc::new(Relay::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Nimmt Verbindungen an, bis der Prozess beendet wird
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Nimmt Verbindungen an, bis `shutdown` fertig ist
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), RelayError> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let relay = Arc::clone(&self.relay);
                    let queue = self.config.outbound_queue;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, relay, queue).await {
                            tracing::warn!("Connection {} ended with error: {}", addr, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("Relay shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Bearbeitet eine einzelne WebSocket-Verbindung bis zum Disconnect
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<Relay>,
    queue: usize,
) -> Result<(), RelayError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| RelayError::Handshake(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(queue);
    let mut ctx = ConnectionContext::new(ConnectionHandle::new(tx));
    tracing::debug!("Connection {} opened from {}", ctx.handle().id(), addr);

    // Write-Task: Sende-Queue → WebSocket
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode {}: {}", msg.kind(), e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    relay.handle(&mut ctx, msg);
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed message from {}: {}", addr, e);
                }
            },
            Ok(Message::Close(_)) => {
                tracing::debug!("WebSocket closed by client {}", addr);
                break;
            }
            Err(e) => {
                tracing::debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            _ => {}
        }
    }

    relay.disconnect(&ctx);
    writer.abort();
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
