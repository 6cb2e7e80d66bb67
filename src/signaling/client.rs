//! WebSocket Client für den Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Registrierung mit Bestätigung
//! - Heartbeat-Keeping
//! - Event-basierte Weitergabe eingehender Nachrichten

use super::messages::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Wartezeit auf `registered` nach dem Verbinden
const REGISTER_TIMEOUT_SECS: u64 = 10;

/// Heartbeat-Intervall
const HEARTBEAT_INTERVAL_SECS: u64 = 25;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
}

// ============================================================================
// SIGNALING SINK
// ============================================================================

/// Ausgehende Richtung des Signalings, wie sie die Call Engine braucht
///
/// Senden darf nicht blockieren.
pub trait SignalingSink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Registrierung bestätigt
    Registered { user_id: String },

    /// Weitere Nachricht vom Relay
    Received(ServerMessage),
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    user_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Relay
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: String) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Registrierte Benutzer-ID (falls registriert)
    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// WebSocket-URL aus der konfigurierten Relay-URL (`http(s)` → `ws(s)`)
    fn websocket_url(&self) -> Result<Url, SignalingError> {
        let mut url =
            Url::parse(&self.server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(SignalingError::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(self.server_url.clone()))?;
        Ok(url)
    }

    /// Verbindet mit dem Relay und registriert den Benutzer
    pub async fn connect_and_register(&mut self, user_id: String) -> Result<String, SignalingError> {
        let ws_url = self.websocket_url()?;

        tracing::info!("Connecting to relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);

        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<String>(1);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state_clone, &event_tx, &reg_tx)
                                .await;
                        }
                        Err(e) => tracing::warn!("Ignoring unparsable relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        self.send(ClientMessage::Register {
            user_id: user_id.clone(),
        })?;

        tokio::select! {
            result = reg_rx.recv() => {
                result.ok_or_else(|| SignalingError::RegistrationFailed("No response".to_string()))
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(REGISTER_TIMEOUT_SECS)) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Raum betreten
    pub fn join_room(&self, room_id: String) -> Result<(), SignalingError> {
        self.send(ClientMessage::JoinRoom { room_id })
    }

    /// Raum verlassen
    pub fn leave_room(&self, room_id: String) -> Result<(), SignalingError> {
        self.send(ClientMessage::LeaveRoom { room_id })
    }

    /// Sendet einen Heartbeat
    pub fn send_heartbeat(&self) -> Result<(), SignalingError> {
        self.send(ClientMessage::Ping)
    }

    /// Serialisiert und reiht eine Nachricht ein (non-blocking)
    fn enqueue(&self, msg: &ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;

        let msg_string =
            serde_json::to_string(msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        tx.try_send(msg_string)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Relay-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<String>,
    ) {
        match msg {
            ServerMessage::Registered { user_id } => {
                tracing::info!("Registered as {}", user_id);
                state.write().user_id = Some(user_id.clone());
                let _ = reg_tx.send(user_id.clone()).await;
                let _ = event_tx.send(SignalingEvent::Registered { user_id });
            }

            ServerMessage::Pong => {
                // Heartbeat-Response - nichts zu tun
            }

            other => {
                tracing::debug!("Received {}", other.kind());
                let _ = event_tx.send(SignalingEvent::Received(other));
            }
        }
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: Arc<Self>) {
        let client = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if client.is_connected() {
                    if let Err(e) = client.send_heartbeat() {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                } else {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
            }
        });
    }
}

impl SignalingSink for SignalingClient {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending {}", msg.kind());
        self.enqueue(&msg)
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::RelayServer;

    #[test]
    fn test_websocket_url_scheme_mapping() {
        let client = SignalingClient::new("https://relay.example.com/ws".to_string());
        assert_eq!(
            client.websocket_url().unwrap().as_str(),
            "wss://relay.example.com/ws"
        );

        let client = SignalingClient::new("http://127.0.0.1:8787".to_string());
        assert_eq!(client.websocket_url().unwrap().scheme(), "ws");

        let client = SignalingClient::new("ftp://relay.example.com".to_string());
        assert!(matches!(
            client.websocket_url(),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_send_without_connection() {
        let client = SignalingClient::new("http://localhost:1".to_string());
        assert_eq!(client.send_heartbeat(), Err(SignalingError::NotConnected));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_register_and_receive_through_relay() {
        let server = RelayServer::bind(RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            outbound_queue: 32,
        })
        .await
        .unwrap();
        let url = format!("http://{}", server.local_addr().unwrap());
        tokio::spawn(server.run());

        let mut alice = SignalingClient::new(url.clone());
        let mut bob = SignalingClient::new(url);
        let mut bob_events = bob.subscribe();

        assert_eq!(alice.connect_and_register("alice".to_string()).await.unwrap(), "alice");
        assert_eq!(bob.connect_and_register("bob".to_string()).await.unwrap(), "bob");
        assert_eq!(bob.user_id().as_deref(), Some("bob"));

        alice
            .send(ClientMessage::EndCall {
                to: "bob".to_string(),
            })
            .unwrap();

        let ended = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Ok(SignalingEvent::Received(msg)) = bob_events.recv().await {
                    return msg;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            ended,
            ServerMessage::CallEnded {
                from: "alice".to_string()
            }
        );
    }
}
