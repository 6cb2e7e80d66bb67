//! Message Types für das Signaling-Protokoll
//!
//! JSON-Textframes mit `type`-Tag (kebab-case) und camelCase-Feldern.
//! Client und Relay teilen sich diese Definitionen, deshalb sind alle
//! Typen sowohl `Serialize` als auch `Deserialize`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// GEMEINSAME TYPEN
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    /// Ob für diesen Anruf eine Kamera benötigt wird
    pub fn wants_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Audio => f.write_str("audio"),
            CallType::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP Offer oder Answer, so wie es der Browser als `RTCSessionDescriptionInit` sendet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate (entspricht `RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Alle Nachrichten, die ein Client an den Relay schickt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Verbindung einem Benutzer zuordnen
    Register {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Raum betreten (für Gruppenanrufe)
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Raum verlassen
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Ausgehender Anruf mit SDP Offer
    CallUser {
        to: String,
        from: String,
        #[serde(rename = "fromName")]
        from_name: String,
        offer: SessionDescription,
        #[serde(rename = "callType")]
        call_type: CallType,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Anruf angenommen, enthält das SDP Answer
    CallAccepted {
        to: String,
        answer: SessionDescription,
    },

    /// Anruf abgelehnt
    CallRejected { to: String, reason: String },

    /// ICE Candidate an den Peer
    IceCandidate { to: String, candidate: IceCandidate },

    /// Anruf beenden
    EndCall { to: String },

    /// Gruppenanruf an alle Raummitglieder ankündigen
    GroupCallStart {
        #[serde(rename = "roomId")]
        room_id: String,
        from: String,
        #[serde(rename = "fromName")]
        from_name: String,
        #[serde(rename = "callType")]
        call_type: CallType,
    },

    /// Heartbeat
    Ping,
}

impl ClientMessage {
    /// Name des Nachrichtentyps (für Logs, ohne Payload)
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::CallUser { .. } => "call-user",
            ClientMessage::CallAccepted { .. } => "call-accepted",
            ClientMessage::CallRejected { .. } => "call-rejected",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::EndCall { .. } => "end-call",
            ClientMessage::GroupCallStart { .. } => "group-call-start",
            ClientMessage::Ping => "ping",
        }
    }

    /// Adressat einer weiterzuleitenden Nachricht
    pub fn target(&self) -> Option<&str> {
        match self {
            ClientMessage::CallUser { to, .. }
            | ClientMessage::CallAccepted { to, .. }
            | ClientMessage::CallRejected { to, .. }
            | ClientMessage::IceCandidate { to, .. }
            | ClientMessage::EndCall { to } => Some(to),
            _ => None,
        }
    }
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle Nachrichten, die der Relay an einen Client schickt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Registrierung bestätigt
    Registered {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Eingehender Anruf (Einzel- oder Gruppenanruf)
    IncomingCall {
        from: String,
        #[serde(rename = "fromName")]
        from_name: String,
        /// Bei Gruppenankündigungen gibt es kein Offer
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer: Option<SessionDescription>,
        #[serde(rename = "callType")]
        call_type: CallType,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(rename = "isGroupCall", default)]
        is_group_call: bool,
    },

    /// SDP Answer des Angerufenen
    CallAnswered {
        from: String,
        answer: SessionDescription,
    },

    /// Anruf wurde abgelehnt
    CallRejected { from: String, reason: String },

    /// ICE Candidate vom Peer
    IceCandidate { from: String, candidate: IceCandidate },

    /// Peer hat aufgelegt
    CallEnded { from: String },

    /// Zustellung fehlgeschlagen (vom Relay erzeugt)
    ///
    /// `to` ist der nicht erreichbare Adressat der ursprünglichen Nachricht.
    CallFailed {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    /// Heartbeat Antwort
    Pong,
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "registered",
            ServerMessage::IncomingCall { .. } => "incoming-call",
            ServerMessage::CallAnswered { .. } => "call-answered",
            ServerMessage::CallRejected { .. } => "call-rejected",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::CallEnded { .. } => "call-ended",
            ServerMessage::CallFailed { .. } => "call-failed",
            ServerMessage::Pong => "pong",
        }
    }
}

/// Grund, den der Relay bei nicht erreichbarem Ziel meldet
pub const REASON_USER_OFFLINE: &str = "user offline";

// ============================================================================
// TESTS
// ============================================================================
