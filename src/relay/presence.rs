//! Presence Registry
//!
//! Flüchtige Zuordnung `userId → Verbindung`. Alle Zugriffe laufen über
//! einen einzigen Mutex, damit ein Disconnect, der mit einem Reconnect
//! desselben Benutzers konkurriert, nie den falschen Eintrag entfernt.

use crate::signaling::ServerMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// CONNECTION HANDLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Outbound queue of connection {0} is full")]
    QueueFull(ConnectionId),

    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

/// Handle auf eine aktive Client-Verbindung
///
/// Identität ist ausschließlich die [`ConnectionId`]; zwei Handles sind
/// gleich, wenn sie dieselbe Verbindung bezeichnen.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Stellt eine Nachricht zu, ohne auf die Verbindung zu warten
    ///
    /// Ist die Sende-Queue voll, wird die Nachricht verworfen.
    pub fn deliver(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.id),
        })
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish()
    }
}

// ============================================================================
// PRESENCE REGISTRY
// ============================================================================

/// Aktuell verbundene Benutzer
#[derive(Default)]
pub struct PresenceRegistry {
    entries: Mutex<HashMap<String, ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordnet den Benutzer der Verbindung zu (letzte Verbindung gewinnt)
    ///
    /// Gibt die ersetzte Verbindung zurück, falls es eine gab.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let replaced = self.entries.lock().insert(user_id.to_string(), handle);
        if let Some(old) = &replaced {
            tracing::info!("User {} reconnected, replacing connection {}", user_id, old.id());
        }
        replaced
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.entries.lock().get(user_id).cloned()
    }

    /// Entfernt den Eintrag, der auf genau diese Verbindung zeigt
    ///
    /// Hat sich der Benutzer inzwischen über eine andere Verbindung neu
    /// registriert, bleibt der neue Eintrag bestehen und es wird `None`
    /// zurückgegeben.
    pub fn unregister(&self, handle: &ConnectionHandle) -> Option<String> {
        let mut entries = self.entries.lock();
        let user_id = entries
            .iter()
            .find(|(_, h)| h.id() == handle.id())
            .map(|(user_id, _)| user_id.clone())?;
        entries.remove(&user_id);
        Some(user_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries.lock().contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("online", &self.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
