//! Call Session Zustandsmaschine
//!
//! Reine Übergangsfunktion ohne Netzwerk oder Geräte: [`CallMachine::apply`]
//! nimmt ein Ereignis (Benutzeraktion, Relay-Nachricht, Timer, Ergebnis
//! eines Media-Schritts) und liefert den neuen Zustand samt der Aktionen,
//! die die [`CallEngine`](super::CallEngine) ausführen muss. Ereignisse, die
//! im aktuellen Zustand keine Bedeutung haben, werden ignoriert.

use super::peer::SessionError;
use crate::signaling::{
    CallType, ClientMessage, IceCandidate, SessionDescription, SignalingError,
};
use thiserror::Error;

/// Grund bei Ablehnung wegen eines laufenden Anrufs
pub const REASON_BUSY: &str = "busy";
/// Grund bei manueller Ablehnung
pub const REASON_DECLINED: &str = "declined";
/// Grund bei abgelaufenem Klingeln
pub const REASON_TIMEOUT: &str = "timeout";
/// Grund, wenn der Angerufene keine Medien bereitstellen konnte
pub const REASON_MEDIA_UNAVAILABLE: &str = "media unavailable";

pub type SessionId = u64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler, die dem Benutzer gemeldet werden
///
/// Alle führen zum Abbau des Anrufs; keiner davon betrifft den Relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("{0} is offline")]
    CalleeOffline(String),

    #[error("Media permission denied: {0}")]
    MediaPermissionDenied(String),

    #[error("No active media stream")]
    NoActiveMediaStream,

    #[error("Media transport failed")]
    TransportFailure,

    #[error("{0} is busy")]
    Busy(String),

    #[error("Call was not answered in time")]
    SetupTimeout,

    #[error("Call rejected: {0}")]
    Rejected(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Media session error: {0}")]
    Session(#[from] SessionError),
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Kein Anruf
    Idle,
    /// Ausgehender Anruf, Offer unterwegs
    Calling,
    /// Eingehender Anruf wartet auf Annahme
    Ringing,
    /// Anruf aktiv
    Connected,
}

/// Lokale Sicht auf einen Anrufversuch
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: SessionId,
    pub local_user_id: String,
    pub remote_user_id: String,
    pub remote_name: String,
    pub call_type: CallType,
    pub state: CallState,
    pub room_id: Option<String>,
    pub is_group_call: bool,
    /// Lokaler Benutzer hat angerufen
    pub outgoing: bool,
    remote_offer: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    media_ready: bool,
}

impl CallSession {
    fn is_remote(&self, user_id: &str) -> bool {
        self.remote_user_id == user_id
    }

    /// Vom Peer erhaltene Candidates, die noch auf die Media Session warten
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }
}

// ============================================================================
// INPUTS & ACTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub enum CallInput {
    /// Benutzer ruft an
    Dial {
        to: String,
        call_type: CallType,
        room_id: Option<String>,
    },
    /// `incoming-call` vom Relay
    IncomingCall {
        from: String,
        from_name: String,
        offer: Option<SessionDescription>,
        call_type: CallType,
        room_id: Option<String>,
        is_group_call: bool,
    },
    /// `call-answered` vom Relay
    AnswerReceived {
        from: String,
        answer: SessionDescription,
    },
    /// `call-rejected` vom Relay
    Rejected { from: String, reason: String },
    /// `call-failed` vom Relay; `to` ist der nicht erreichbare Adressat
    CallFailed { reason: String, to: Option<String> },
    /// `call-ended` vom Relay
    RemoteEnded { from: String },
    /// `ice-candidate` vom Relay
    RemoteCandidate {
        from: String,
        candidate: IceCandidate,
    },
    Accept,
    Decline,
    Cancel,
    /// Auflegen aus jedem aktiven Zustand
    Hangup,
    /// Media-Transport meldet Verbindungsverlust
    TransportLost { id: SessionId },
    /// Relay-Nachrichten gingen verloren, der Ablauf ist nicht mehr verlässlich
    SignalingLost,
    SetupTimeout { id: SessionId },
    /// Media Session hat die Remote Description, Candidates können angewendet werden
    MediaReady { id: SessionId },
    /// Geräte oder Media Session konnten nicht bereitgestellt werden
    MediaFailed { id: SessionId, error: CallError },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    ArmSetupTimer,
    AcquireTracks(CallType),
    /// Media Session anlegen, Offer erzeugen und als `call-user` senden
    SendOffer {
        to: String,
        from_name: String,
        call_type: CallType,
        room_id: Option<String>,
    },
    /// Offer übernehmen, Answer erzeugen und als `call-accepted` senden
    SendAnswer {
        to: String,
        offer: SessionDescription,
    },
    SurfaceIncoming {
        from: String,
        from_name: String,
        call_type: CallType,
        room_id: Option<String>,
        is_group_call: bool,
    },
    ApplyAnswer(SessionDescription),
    ApplyCandidate(IceCandidate),
    Send(ClientMessage),
    ReleaseMedia,
    StartDuration,
    StopDuration,
    Notify(CallError),
}

/// Ergebnis eines angewendeten Ereignisses
#[derive(Debug, Clone)]
pub struct Transition {
    pub session_id: SessionId,
    pub state: CallState,
    pub changed: bool,
    pub actions: Vec<CallAction>,
}

// ============================================================================
// MACHINE
// ============================================================================

/// Zustandsmaschine eines lokalen Benutzers; höchstens ein aktiver Anruf
#[derive(Debug)]
pub struct CallMachine {
    local_user_id: String,
    local_name: String,
    session: Option<CallSession>,
    next_id: SessionId,
}

impl CallMachine {
    pub fn new(local_user_id: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            local_name: local_name.into(),
            session: None,
            next_id: 1,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Ob `id` der aktive Anrufversuch ist
    pub fn is_current(&self, id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == id)
    }

    /// Wendet ein Ereignis an; `None` heißt ignoriert
    pub fn apply(&mut self, input: CallInput) -> Option<Transition> {
        let before = self.state();
        let (session_id, actions) = self.step(input)?;
        let state = self.state();
        Some(Transition {
            session_id,
            state,
            changed: state != before,
            actions,
        })
    }

    fn step(&mut self, input: CallInput) -> Option<(SessionId, Vec<CallAction>)> {
        use CallAction::*;
        use CallState::*;

        match input {
            CallInput::Dial {
                to,
                call_type,
                room_id,
            } => {
                if self.session.is_some() {
                    return None;
                }
                let id = self.begin(to.clone(), to.clone(), call_type, Calling);
                if let Some(session) = self.session.as_mut() {
                    session.outgoing = true;
                    session.room_id = room_id.clone();
                }
                Some((
                    id,
                    vec![
                        ArmSetupTimer,
                        AcquireTracks(call_type),
                        SendOffer {
                            to,
                            from_name: self.local_name.clone(),
                            call_type,
                            room_id,
                        },
                    ],
                ))
            }

            CallInput::IncomingCall {
                from,
                from_name,
                offer,
                call_type,
                room_id,
                is_group_call,
            } => {
                if let Some(session) = &self.session {
                    if is_group_call {
                        tracing::debug!("Ignoring group call from {} while busy", from);
                        return None;
                    }
                    if session.state == Ringing && session.is_remote(&from) {
                        tracing::debug!("Ignoring duplicate offer from {}", from);
                        return None;
                    }
                    tracing::info!("Rejecting call from {}: busy", from);
                    return Some((
                        session.id,
                        vec![Send(ClientMessage::CallRejected {
                            to: from,
                            reason: REASON_BUSY.to_string(),
                        })],
                    ));
                }

                if !is_group_call && offer.is_none() {
                    tracing::warn!("Ignoring incoming call from {} without offer", from);
                    return None;
                }

                let id = self.begin(from.clone(), from_name.clone(), call_type, Ringing);
                if let Some(session) = self.session.as_mut() {
                    session.room_id = room_id.clone();
                    session.is_group_call = is_group_call;
                    session.remote_offer = offer;
                }
                Some((
                    id,
                    vec![
                        ArmSetupTimer,
                        SurfaceIncoming {
                            from,
                            from_name,
                            call_type,
                            room_id,
                            is_group_call,
                        },
                    ],
                ))
            }

            CallInput::AnswerReceived { from, answer } => {
                let session = self.session.as_mut()?;
                if session.state != Calling || !session.is_remote(&from) {
                    return None;
                }
                session.state = Connected;
                Some((session.id, vec![ApplyAnswer(answer), StartDuration]))
            }

            CallInput::Rejected { from, reason } => {
                let session = self.session.as_ref()?;
                if session.state != Calling || !session.is_remote(&from) {
                    return None;
                }
                let error = if reason == REASON_BUSY {
                    CallError::Busy(from)
                } else if reason.is_empty() {
                    CallError::Rejected(REASON_DECLINED.to_string())
                } else {
                    CallError::Rejected(reason)
                };
                let id = self.end();
                Some((id, vec![ReleaseMedia, Notify(error)]))
            }

            CallInput::CallFailed { reason, to } => {
                let session = self.session.as_ref()?;
                if session.state != Calling {
                    return None;
                }
                // Nur die Antwort auf das eigene `call-user` zählt; ein
                // `call-failed` für ein früheres `end-call` oder einen
                // Candidate an einen anderen Peer gehört nicht zu dieser Session
                match to.as_deref() {
                    Some(to) if session.is_remote(to) => {}
                    Some(to) => {
                        tracing::debug!(
                            "Ignoring call-failed for {} while calling {}",
                            to,
                            session.remote_user_id
                        );
                        return None;
                    }
                    None => {
                        tracing::debug!("Ignoring call-failed without target");
                        return None;
                    }
                }
                tracing::info!("Call to {} failed: {}", session.remote_user_id, reason);
                let remote = session.remote_user_id.clone();
                let id = self.end();
                Some((id, vec![ReleaseMedia, Notify(CallError::CalleeOffline(remote))]))
            }

            CallInput::RemoteEnded { from } => {
                let session = self.session.as_ref()?;
                if !session.is_remote(&from) {
                    return None;
                }
                let was_connected = session.state == Connected;
                let id = self.end();
                let mut actions = Vec::new();
                if was_connected {
                    actions.push(StopDuration);
                }
                actions.push(ReleaseMedia);
                Some((id, actions))
            }

            CallInput::RemoteCandidate { from, candidate } => {
                let session = self.session.as_mut()?;
                if !session.is_remote(&from) {
                    return None;
                }
                if session.media_ready {
                    Some((session.id, vec![ApplyCandidate(candidate)]))
                } else {
                    session.pending_candidates.push(candidate);
                    Some((session.id, Vec::new()))
                }
            }

            CallInput::Accept => {
                let session = self.session.as_mut()?;
                if session.state != Ringing {
                    return None;
                }

                if session.is_group_call {
                    // Gruppenanruf: eigener Einzelanruf an den Ankündigenden
                    let to = session.remote_user_id.clone();
                    let name = session.remote_name.clone();
                    let call_type = session.call_type;
                    let room_id = session.room_id.clone();
                    self.session = None;

                    let id = self.begin(to.clone(), name, call_type, Calling);
                    if let Some(session) = self.session.as_mut() {
                        session.outgoing = true;
                        session.is_group_call = true;
                        session.room_id = room_id.clone();
                    }
                    return Some((
                        id,
                        vec![
                            ArmSetupTimer,
                            AcquireTracks(call_type),
                            SendOffer {
                                to,
                                from_name: self.local_name.clone(),
                                call_type,
                                room_id,
                            },
                        ],
                    ));
                }

                let offer = session.remote_offer.take()?;
                session.state = Connected;
                Some((
                    session.id,
                    vec![
                        AcquireTracks(session.call_type),
                        SendAnswer {
                            to: session.remote_user_id.clone(),
                            offer,
                        },
                        StartDuration,
                    ],
                ))
            }

            CallInput::Decline => {
                let session = self.session.as_ref()?;
                if session.state != Ringing {
                    return None;
                }
                Some(self.decline_with(REASON_DECLINED))
            }

            CallInput::Cancel => {
                let session = self.session.as_ref()?;
                if session.state != Calling {
                    return None;
                }
                Some(self.hang_up())
            }

            CallInput::Hangup => match self.state() {
                Idle => None,
                Ringing => Some(self.decline_with(REASON_DECLINED)),
                Calling | Connected => Some(self.hang_up()),
            },

            CallInput::SignalingLost => {
                let (id, mut actions) = match self.state() {
                    Idle => return None,
                    Ringing => self.decline_with(REASON_DECLINED),
                    Calling | Connected => self.hang_up(),
                };
                actions.push(Notify(CallError::TransportFailure));
                Some((id, actions))
            }

            CallInput::TransportLost { id } => {
                let session = self.session.as_ref()?;
                if session.id != id || session.state != Connected {
                    return None;
                }
                let id = self.end();
                Some((
                    id,
                    vec![StopDuration, ReleaseMedia, Notify(CallError::TransportFailure)],
                ))
            }

            CallInput::SetupTimeout { id } => {
                let session = self.session.as_ref()?;
                if session.id != id {
                    return None;
                }
                let state = session.state;
                let (_, mut actions) = match state {
                    Calling => self.hang_up(),
                    Ringing => self.decline_with(REASON_TIMEOUT),
                    Idle | Connected => return None,
                };
                actions.push(Notify(CallError::SetupTimeout));
                Some((id, actions))
            }

            CallInput::MediaReady { id } => {
                let session = self.session.as_mut()?;
                if session.id != id {
                    return None;
                }
                session.media_ready = true;
                let actions = session
                    .pending_candidates
                    .drain(..)
                    .map(ApplyCandidate)
                    .collect();
                Some((id, actions))
            }

            CallInput::MediaFailed { id, error } => {
                let session = self.session.as_ref()?;
                if session.id != id {
                    return None;
                }
                let to = session.remote_user_id.clone();
                let mut actions = Vec::new();
                if session.state == Connected {
                    actions.push(StopDuration);
                }
                // Der Angerufene hat noch kein Answer geschickt, der Anrufer
                // wartet also auf eine Ablehnung
                let notice = if session.outgoing {
                    ClientMessage::EndCall { to }
                } else {
                    ClientMessage::CallRejected {
                        to,
                        reason: REASON_MEDIA_UNAVAILABLE.to_string(),
                    }
                };
                actions.extend([Send(notice), ReleaseMedia, Notify(error)]);
                self.end();
                Some((id, actions))
            }
        }
    }

    fn begin(
        &mut self,
        remote_user_id: String,
        remote_name: String,
        call_type: CallType,
        state: CallState,
    ) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        self.session = Some(CallSession {
            id,
            local_user_id: self.local_user_id.clone(),
            remote_user_id,
            remote_name,
            call_type,
            state,
            room_id: None,
            is_group_call: false,
            outgoing: false,
            remote_offer: None,
            pending_candidates: Vec::new(),
            media_ready: false,
        });
        id
    }

    /// Beendet die aktive Session und gibt ihre ID zurück
    fn end(&mut self) -> SessionId {
        self.session.take().map_or(0, |s| s.id)
    }

    /// Lokales Auflegen aus `calling` oder `connected`
    fn hang_up(&mut self) -> (SessionId, Vec<CallAction>) {
        let mut actions = Vec::new();
        if let Some(session) = &self.session {
            if session.state == CallState::Connected {
                actions.push(CallAction::StopDuration);
            }
            actions.push(CallAction::Send(ClientMessage::EndCall {
                to: session.remote_user_id.clone(),
            }));
        }
        actions.push(CallAction::ReleaseMedia);
        (self.end(), actions)
    }

    /// Ablehnen eines klingelnden Anrufs; Gruppenankündigungen nur lokal
    fn decline_with(&mut self, reason: &str) -> (SessionId, Vec<CallAction>) {
        let mut actions = Vec::new();
        if let Some(session) = &self.session {
            if !session.is_group_call {
                actions.push(CallAction::Send(ClientMessage::CallRejected {
                    to: session.remote_user_id.clone(),
                    reason: reason.to_string(),
                }));
            }
        }
        actions.push(CallAction::ReleaseMedia);
        (self.end(), actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallAction::*;

    fn machine() -> CallMachine {
        CallMachine::new("alice", "Alice")
    }

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0 offer")
    }

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn incoming(from: &str) -> CallInput {
        CallInput::IncomingCall {
            from: from.to_string(),
            from_name: from.to_uppercase(),
            offer: Some(offer()),
            call_type: CallType::Video,
            room_id: None,
            is_group_call: false,
        }
    }

    fn dial(m: &mut CallMachine) -> SessionId {
        m.apply(CallInput::Dial {
            to: "bob".to_string(),
            call_type: CallType::Audio,
            room_id: None,
        })
        .unwrap()
        .session_id
    }

    #[test]
    fn test_dial_acquires_then_offers() {
        let mut m = machine();
        let t = m
            .apply(CallInput::Dial {
                to: "bob".to_string(),
                call_type: CallType::Video,
                room_id: Some("room-1".to_string()),
            })
            .unwrap();

        assert_eq!(t.state, CallState::Calling);
        assert!(t.changed);
        assert_eq!(
            t.actions,
            vec![
                ArmSetupTimer,
                AcquireTracks(CallType::Video),
                SendOffer {
                    to: "bob".to_string(),
                    from_name: "Alice".to_string(),
                    call_type: CallType::Video,
                    room_id: Some("room-1".to_string()),
                },
            ]
        );
        assert!(m.session().unwrap().outgoing);

        // Zweiter Anruf während calling wird ignoriert
        assert!(m
            .apply(CallInput::Dial {
                to: "carol".to_string(),
                call_type: CallType::Audio,
                room_id: None,
            })
            .is_none());
    }

    #[test]
    fn test_answer_connects_only_while_calling() {
        let mut m = machine();

        // idle: ignoriert
        assert!(m
            .apply(CallInput::AnswerReceived {
                from: "bob".to_string(),
                answer: SessionDescription::answer("a"),
            })
            .is_none());

        dial(&mut m);
        let t = m
            .apply(CallInput::AnswerReceived {
                from: "bob".to_string(),
                answer: SessionDescription::answer("a"),
            })
            .unwrap();
        assert_eq!(t.state, CallState::Connected);
        assert_eq!(
            t.actions,
            vec![ApplyAnswer(SessionDescription::answer("a")), StartDuration]
        );

        // Duplikat im connected-Zustand: keine Änderung
        assert!(m
            .apply(CallInput::AnswerReceived {
                from: "bob".to_string(),
                answer: SessionDescription::answer("a"),
            })
            .is_none());
        assert_eq!(m.state(), CallState::Connected);
    }

    #[test]
    fn test_answer_from_someone_else_is_ignored() {
        let mut m = machine();
        dial(&mut m);
        assert!(m
            .apply(CallInput::AnswerReceived {
                from: "mallory".to_string(),
                answer: SessionDescription::answer("a"),
            })
            .is_none());
        assert_eq!(m.state(), CallState::Calling);
    }

    #[test]
    fn test_rejection_and_failure_release_media() {
        let mut m = machine();
        dial(&mut m);
        let t = m
            .apply(CallInput::Rejected {
                from: "bob".to_string(),
                reason: "busy".to_string(),
            })
            .unwrap();
        assert_eq!(t.state, CallState::Idle);
        assert_eq!(
            t.actions,
            vec![ReleaseMedia, Notify(CallError::Busy("bob".to_string()))]
        );

        dial(&mut m);
        let t = m
            .apply(CallInput::CallFailed {
                reason: "user offline".to_string(),
                to: Some("bob".to_string()),
            })
            .unwrap();
        assert_eq!(t.state, CallState::Idle);
        assert_eq!(
            t.actions,
            vec![
                ReleaseMedia,
                Notify(CallError::CalleeOffline("bob".to_string()))
            ]
        );
    }

    #[test]
    fn test_call_failed_for_other_target_is_ignored() {
        let mut m = machine();
        dial(&mut m);

        // Antwort auf ein end-call an den vorherigen Peer
        assert!(m
            .apply(CallInput::CallFailed {
                reason: "user offline".to_string(),
                to: Some("carol".to_string()),
            })
            .is_none());
        assert!(m
            .apply(CallInput::CallFailed {
                reason: "user offline".to_string(),
                to: None,
            })
            .is_none());

        assert_eq!(m.state(), CallState::Calling);
        assert_eq!(m.session().unwrap().remote_user_id, "bob");
    }

    #[test]
    fn test_lost_signaling_tears_down_active_call() {
        let mut m = machine();
        assert!(m.apply(CallInput::SignalingLost).is_none());

        dial(&mut m);
        let t = m.apply(CallInput::SignalingLost).unwrap();
        assert_eq!(t.state, CallState::Idle);
        assert_eq!(
            t.actions,
            vec![
                Send(ClientMessage::EndCall {
                    to: "bob".to_string()
                }),
                ReleaseMedia,
                Notify(CallError::TransportFailure)
            ]
        );
    }

    #[test]
    fn test_cancel_sends_end_call() {
        let mut m = machine();
        dial(&mut m);
        let t = m.apply(CallInput::Cancel).unwrap();
        assert_eq!(t.state, CallState::Idle);
        assert_eq!(
            t.actions,
            vec![
                Send(ClientMessage::EndCall {
                    to: "bob".to_string()
                }),
                ReleaseMedia
            ]
        );
        assert!(m.apply(CallInput::Cancel).is_none());
    }

    #[test]
    fn test_incoming_accept_answers() {
        let mut m = machine();
        let t = m.apply(incoming("bob")).unwrap();
        assert_eq!(t.state, CallState::Ringing);
        assert!(matches!(t.actions[1], SurfaceIncoming { .. }));

        let t = m.apply(CallInput::Accept).unwrap();
        assert_eq!(t.state, CallState::Connected);
        assert_eq!(
            t.actions,
            vec![
                AcquireTracks(CallType::Video),
                SendAnswer {
                    to: "bob".to_string(),
                    offer: offer(),
                },
                StartDuration,
            ]
        );
    }

    #[test]
    fn test_decline_rejects_caller() {
        let mut m = machine();
        m.apply(incoming("bob")).unwrap();
        let t = m.apply(CallInput::Decline).unwrap();
        assert_eq!(t.state, CallState::Idle);
        assert_eq!(
            t.actions,
            vec![
                Send(ClientMessage::CallRejected {
                    to: "bob".to_string(),
                    reason: REASON_DECLINED.to_string(),
                }),
                ReleaseMedia
            ]
        );
    }

    #[test]
    fn test_busy_while_in_call() {
        let mut m = machine();
        dial(&mut m);
        let t = m.apply(incoming("carol")).unwrap();
        assert!(!t.changed);
        assert_eq!(
            t.actions,
            vec![Send(ClientMessage::CallRejected {
                to: "carol".to_string(),
                reason: REASON_BUSY.to_string(),
            })]
        );
        assert_eq!(m.session().unwrap().remote_user_id, "bob");
    }

    #[test]
    fn test_duplicate_offer_while_ringing_is_ignored() {
        let mut m = machine();
        m.apply(incoming("bob")).unwrap();
        assert!(m.apply(incoming("bob")).is_none());
        assert_eq!(m.state(), CallState::Ringing);
    }

    #[test]
    fn test_teardown_from_connected() {
        for input in [
            CallInput::Hangup,
            CallInput::RemoteEnded {
                from: "bob".to_string(),
            },
        ] {
            let mut m = machine();
            m.apply(incoming("bob")).unwrap();
            m.apply(CallInput::Accept).unwrap();
            let t = m.apply(input).unwrap();
            assert_eq!(t.state, CallState::Idle);
            assert_eq!(t.actions.first(), Some(&StopDuration));
            assert!(t.actions.contains(&ReleaseMedia));
        }

        let mut m = machine();
        m.apply(incoming("bob")).unwrap();
        let id = m.apply(CallInput::Accept).unwrap().session_id;
        assert!(m.apply(CallInput::TransportLost { id: id + 1 }).is_none());
        let t = m.apply(CallInput::TransportLost { id }).unwrap();
        assert_eq!(
            t.actions,
            vec![StopDuration, ReleaseMedia, Notify(CallError::TransportFailure)]
        );
    }

    #[test]
    fn test_candidates_buffer_until_media_ready() {
        let mut m = machine();
        let id = m.apply(incoming("bob")).unwrap().session_id;

        let t = m
            .apply(CallInput::RemoteCandidate {
                from: "bob".to_string(),
                candidate: candidate(1),
            })
            .unwrap();
        assert!(t.actions.is_empty());
        m.apply(CallInput::RemoteCandidate {
            from: "bob".to_string(),
            candidate: candidate(2),
        });
        assert_eq!(m.session().unwrap().pending_candidates(), 2);

        m.apply(CallInput::Accept).unwrap();
        let t = m.apply(CallInput::MediaReady { id }).unwrap();
        assert_eq!(
            t.actions,
            vec![ApplyCandidate(candidate(1)), ApplyCandidate(candidate(2))]
        );

        let t = m
            .apply(CallInput::RemoteCandidate {
                from: "bob".to_string(),
                candidate: candidate(3),
            })
            .unwrap();
        assert_eq!(t.actions, vec![ApplyCandidate(candidate(3))]);
    }

    #[test]
    fn test_candidates_in_idle_are_dropped() {
        let mut m = machine();
        assert!(m
            .apply(CallInput::RemoteCandidate {
                from: "bob".to_string(),
                candidate: candidate(1),
            })
            .is_none());
    }

    #[test]
    fn test_setup_timeout() {
        let mut m = machine();
        let id = dial(&mut m);
        assert!(m.apply(CallInput::SetupTimeout { id: id + 7 }).is_none());
        let t = m.apply(CallInput::SetupTimeout { id }).unwrap();
        assert_eq!(t.state, CallState::Idle);
        assert_eq!(
            t.actions,
            vec![
                Send(ClientMessage::EndCall {
                    to: "bob".to_string()
                }),
                ReleaseMedia,
                Notify(CallError::SetupTimeout),
            ]
        );

        let id = m.apply(incoming("carol")).unwrap().session_id;
        let t = m.apply(CallInput::SetupTimeout { id }).unwrap();
        assert_eq!(
            t.actions[0],
            Send(ClientMessage::CallRejected {
                to: "carol".to_string(),
                reason: REASON_TIMEOUT.to_string(),
            })
        );

        // Nach dem Verbinden bleibt der Timer wirkungslos
        let mut m = machine();
        let id = dial(&mut m);
        m.apply(CallInput::AnswerReceived {
            from: "bob".to_string(),
            answer: SessionDescription::answer("a"),
        });
        assert!(m.apply(CallInput::SetupTimeout { id }).is_none());
    }

    #[test]
    fn test_media_failure_on_callee_rejects() {
        let mut m = machine();
        m.apply(incoming("bob")).unwrap();
        let id = m.apply(CallInput::Accept).unwrap().session_id;
        let error = CallError::MediaPermissionDenied("camera".to_string());
        let t = m
            .apply(CallInput::MediaFailed {
                id,
                error: error.clone(),
            })
            .unwrap();
        assert_eq!(t.state, CallState::Idle);
        assert_eq!(
            t.actions,
            vec![
                StopDuration,
                Send(ClientMessage::CallRejected {
                    to: "bob".to_string(),
                    reason: REASON_MEDIA_UNAVAILABLE.to_string(),
                }),
                ReleaseMedia,
                Notify(error),
            ]
        );
    }

    #[test]
    fn test_group_call_accept_dials_announcer() {
        let mut m = machine();
        let ringing = m
            .apply(CallInput::IncomingCall {
                from: "host".to_string(),
                from_name: "Teacher".to_string(),
                offer: None,
                call_type: CallType::Video,
                room_id: Some("class-7".to_string()),
                is_group_call: true,
            })
            .unwrap();
        assert_eq!(ringing.state, CallState::Ringing);

        let t = m.apply(CallInput::Accept).unwrap();
        assert_eq!(t.state, CallState::Calling);
        assert_ne!(t.session_id, ringing.session_id);
        assert!(t.actions.contains(&SendOffer {
            to: "host".to_string(),
            from_name: "Alice".to_string(),
            call_type: CallType::Video,
            room_id: Some("class-7".to_string()),
        }));
        let session = m.session().unwrap();
        assert!(session.is_group_call && session.outgoing);

        // Alter Timer der Ankündigung greift nicht mehr
        assert!(m
            .apply(CallInput::SetupTimeout {
                id: ringing.session_id
            })
            .is_none());
    }

    #[test]
    fn test_group_call_decline_is_local() {
        let mut m = machine();
        m.apply(CallInput::IncomingCall {
            from: "host".to_string(),
            from_name: "Teacher".to_string(),
            offer: None,
            call_type: CallType::Audio,
            room_id: Some("class-7".to_string()),
            is_group_call: true,
        });
        let t = m.apply(CallInput::Decline).unwrap();
        assert_eq!(t.actions, vec![ReleaseMedia]);
        assert_eq!(m.state(), CallState::Idle);
    }
}
