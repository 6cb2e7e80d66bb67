//! Signaling Relay
//!
//! Zustandsloser Router: löst den Adressaten über die Presence Registry
//! auf und leitet die Nachricht unverändert weiter. Die Gültigkeit eines
//! Anrufablaufs wird hier nicht geprüft, das übernimmt die
//! Zustandsmaschine beim Empfänger.

use super::presence::{ConnectionHandle, DeliveryError, PresenceRegistry};
use super::rooms::RoomDirectory;
use crate::signaling::{ClientMessage, ServerMessage, REASON_USER_OFFLINE};

// ============================================================================
// CONNECTION CONTEXT
// ============================================================================

/// Zustand einer einzelnen Verbindung, gehört dem jeweiligen Handler-Task
#[derive(Debug)]
pub struct ConnectionContext {
    handle: ConnectionHandle,
    user_id: Option<String>,
}

impl ConnectionContext {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            user_id: None,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Benutzer, als der sich diese Verbindung registriert hat
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Absender einer Nachricht
    ///
    /// Nach der Registrierung zählt die Identität der Verbindung, eine
    /// abweichende Angabe des Clients wird überschrieben.
    fn sender(&self, claimed: Option<&str>) -> Option<String> {
        match (&self.user_id, claimed) {
            (Some(known), Some(claimed)) if known != claimed => {
                tracing::warn!(
                    "Connection {} registered as {} claimed to be {}, using registered id",
                    self.handle.id(),
                    known,
                    claimed
                );
                Some(known.clone())
            }
            (Some(known), _) => Some(known.clone()),
            (None, claimed) => claimed.map(String::from),
        }
    }
}

// ============================================================================
// ROUTE OUTCOME
// ============================================================================

/// Ergebnis der Verarbeitung einer Client-Nachricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// An den Adressaten übergeben
    Delivered,
    /// Adressat nicht verbunden, `call-failed` an den Absender geschickt
    Offline,
    /// Adressat verbunden, aber Zustellung nicht möglich
    Dropped(DeliveryError),
    /// Gruppenankündigung an so viele Mitglieder zugestellt
    Broadcast(usize),
    /// Verbindung registriert
    Registered,
    /// Raum-Mitgliedschaft geändert bzw. Heartbeat beantwortet
    Handled,
    /// Absender unbekannt, Nachricht verworfen
    Unidentified,
}

// ============================================================================
// RELAY
// ============================================================================

/// Relay aus Presence Registry und Raumverzeichnis
#[derive(Debug, Default)]
pub struct Relay {
    presence: PresenceRegistry,
    rooms: RoomDirectory,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    /// Verarbeitet eine Nachricht einer Verbindung
    ///
    /// Wird pro Verbindung strikt sequentiell aufgerufen; dadurch kommen
    /// Nachrichten eines Absenders an einen Empfänger in Reihenfolge an.
    pub fn handle(&self, conn: &mut ConnectionContext, msg: ClientMessage) -> RouteOutcome {
        tracing::debug!(
            "Connection {} ({:?}) sent {}",
            conn.handle.id(),
            conn.user_id,
            msg.kind()
        );

        match msg {
            ClientMessage::Register { user_id } => self.register(conn, user_id),

            ClientMessage::JoinRoom { room_id } => match conn.user_id() {
                Some(user_id) => {
                    if self.rooms.join(&room_id, user_id) {
                        tracing::info!("User {} joined room {}", user_id, room_id);
                    }
                    RouteOutcome::Handled
                }
                None => {
                    tracing::warn!("join-room from unregistered connection {}", conn.handle.id());
                    RouteOutcome::Unidentified
                }
            },

            ClientMessage::LeaveRoom { room_id } => match conn.user_id() {
                Some(user_id) => {
                    self.rooms.leave(&room_id, user_id);
                    RouteOutcome::Handled
                }
                None => RouteOutcome::Unidentified,
            },

            ClientMessage::Ping => {
                let _ = conn.handle.deliver(ServerMessage::Pong);
                RouteOutcome::Handled
            }

            ClientMessage::GroupCallStart {
                room_id,
                from,
                from_name,
                call_type,
            } => {
                let Some(from) = conn.sender(Some(&from)) else {
                    return RouteOutcome::Unidentified;
                };
                self.broadcast_group_call(&room_id, &from, from_name, call_type)
            }

            routed => self.route(conn, routed),
        }
    }

    /// Leitet eine adressierte Nachricht weiter
    pub fn route(&self, conn: &ConnectionContext, msg: ClientMessage) -> RouteOutcome {
        let claimed = match &msg {
            ClientMessage::CallUser { from, .. } => Some(from.as_str()),
            _ => None,
        };
        let Some(from) = conn.sender(claimed) else {
            tracing::warn!(
                "Dropping {} from unregistered connection {}",
                msg.kind(),
                conn.handle.id()
            );
            return RouteOutcome::Unidentified;
        };

        let Some(to) = msg.target().map(String::from) else {
            return RouteOutcome::Handled;
        };

        let Some(target) = self.presence.lookup(&to) else {
            tracing::info!("{} from {} to {}: user offline", msg.kind(), from, to);
            let failed = ServerMessage::CallFailed {
                reason: REASON_USER_OFFLINE.to_string(),
                to: Some(to.clone()),
            };
            if let Err(e) = conn.handle.deliver(failed) {
                tracing::warn!("Could not report offline target to {}: {}", from, e);
            }
            return RouteOutcome::Offline;
        };

        let Some(forwarded) = Self::forward(msg, from.clone()) else {
            return RouteOutcome::Handled;
        };

        match target.deliver(forwarded) {
            Ok(()) => RouteOutcome::Delivered,
            Err(e) => {
                tracing::warn!("Dropping message from {} to {}: {}", from, to, e);
                RouteOutcome::Dropped(e)
            }
        }
    }

    /// Meldet die Verbindung ab; räumt Räume nur auf, wenn der Eintrag wirklich entfernt wurde
    pub fn disconnect(&self, conn: &ConnectionContext) {
        match self.presence.unregister(&conn.handle) {
            Some(user_id) => {
                self.rooms.leave_all(&user_id);
                tracing::info!("User {} went offline", user_id);
            }
            None => {
                if let Some(user_id) = conn.user_id() {
                    tracing::debug!(
                        "Stale disconnect for {} on connection {}, newer connection stays",
                        user_id,
                        conn.handle.id()
                    );
                }
            }
        }
    }

    fn register(&self, conn: &mut ConnectionContext, user_id: String) -> RouteOutcome {
        if let Some(previous) = conn.user_id.take() {
            if previous != user_id && self.presence.unregister(&conn.handle).is_some() {
                self.rooms.leave_all(&previous);
            }
        }

        self.presence.register(&user_id, conn.handle.clone());
        tracing::info!("User {} registered on connection {}", user_id, conn.handle.id());

        let _ = conn.handle.deliver(ServerMessage::Registered {
            user_id: user_id.clone(),
        });
        conn.user_id = Some(user_id);
        RouteOutcome::Registered
    }

    fn broadcast_group_call(
        &self,
        room_id: &str,
        from: &str,
        from_name: String,
        call_type: crate::signaling::CallType,
    ) -> RouteOutcome {
        let members = self.rooms.members_except(room_id, from);
        let mut delivered = 0;

        for member in members {
            let Some(target) = self.presence.lookup(&member) else {
                tracing::debug!("Room {} member {} is offline, skipping", room_id, member);
                continue;
            };

            let notification = ServerMessage::IncomingCall {
                from: from.to_string(),
                from_name: from_name.clone(),
                offer: None,
                call_type,
                room_id: Some(room_id.to_string()),
                is_group_call: true,
            };

            match target.deliver(notification) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Group call notice to {} dropped: {}", member, e),
            }
        }

        tracing::info!(
            "Group call by {} in room {} announced to {} member(s)",
            from,
            room_id,
            delivered
        );
        RouteOutcome::Broadcast(delivered)
    }

    /// Übersetzt eine Client-Nachricht in die Form, die der Empfänger sieht
    fn forward(msg: ClientMessage, from: String) -> Option<ServerMessage> {
        let forwarded = match msg {
            ClientMessage::CallUser {
                from_name,
                offer,
                call_type,
                room_id,
                ..
            } => ServerMessage::IncomingCall {
                from,
                from_name,
                offer: Some(offer),
                call_type,
                room_id,
                is_group_call: false,
            },
            ClientMessage::CallAccepted { answer, .. } => ServerMessage::CallAnswered { from, answer },
            ClientMessage::CallRejected { reason, .. } => ServerMessage::CallRejected { from, reason },
            ClientMessage::IceCandidate { candidate, .. } => {
                ServerMessage::IceCandidate { from, candidate }
            }
            ClientMessage::EndCall { .. } => ServerMessage::CallEnded { from },
            _ => return None,
        };
        Some(forwarded)
    }
}

// ============================================================================
// TESTS
// ============================================================================
