//! Signaling Module - Protokoll und WebSocket Client
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - Nachrichtentypen für beide Richtungen
//! - WebSocket-Verbindung aufbauen und halten
//! - Eingehende Nachrichten parsen und als Events weiterleiten
//!

mod client;
mod messages;

pub use client::{SignalingClient, SignalingError, SignalingEvent, SignalingSink};
pub use messages::*;
