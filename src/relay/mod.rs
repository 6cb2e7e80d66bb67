//! Relay Module - Signaling-Server
//!
//! Dieses Modul enthält die Serverseite des Signalings:
//! - Presence Registry (welcher Benutzer ist über welche Verbindung erreichbar)
//! - Raumverzeichnis für Gruppenankündigungen
//! - Router, der adressierte Nachrichten weiterleitet
//! - WebSocket Server
//!

mod presence;
mod rooms;
mod router;
mod server;

pub use presence::{ConnectionHandle, ConnectionId, DeliveryError, PresenceRegistry};
pub use rooms::RoomDirectory;
pub use router::{ConnectionContext, Relay, RouteOutcome};
pub use server::{RelayError, RelayServer};
