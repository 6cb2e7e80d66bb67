//! Call Engine
//!
//! Führt die [`CallMachine`] eines lokalen Benutzers aus: Ereignisse
//! werden unter einem Lock angewendet, die resultierenden Aktionen
//! (Geräte anfordern, Media Session, Signaling, Timer) laufen danach.
//! Während eine Aktion wartet (z.B. auf die Gerätefreigabe), können
//! weitere Ereignisse wie Auflegen verarbeitet werden; überholte Aktionen
//! erkennen das an der Session-ID und brechen ab.
//!
//! Führt ein Übergang zurück nach `Idle`, werden Media Session und Geräte
//! noch unter dem Lock vom Anruf gelöst. Ein sofort folgender neuer Anruf
//! findet die Geräte frei vor und kann vom Abbau nicht mehr getroffen werden.

use super::devices::{CaptureDevices, SystemDevices};
use super::media::{MediaController, MediaError, ReleasedMedia};
use super::peer::{MediaSession, MediaSessionFactory, SessionEvent, TransportState, WebRtcSessionFactory};
use super::session::{
    CallAction, CallError, CallInput, CallMachine, CallSession, CallState, SessionId, Transition,
};
use super::tracks::MediaTrack;
use crate::config::CallConfig;
use crate::signaling::{
    CallType, ClientMessage, IceCandidate, ServerMessage, SignalingEvent, SignalingSink,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),

    /// Eingehender Anruf oder Gruppenankündigung
    IncomingCall {
        from: String,
        from_name: String,
        call_type: CallType,
        room_id: Option<String>,
        is_group_call: bool,
    },

    /// Sekunden seit dem Verbinden, einmal pro Sekunde
    DurationTick { seconds: u64 },

    /// Track vom Peer empfangen
    RemoteTrack(Arc<MediaTrack>),

    Error(CallError),
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::MediaPermissionDenied(e) => CallError::MediaPermissionDenied(e.to_string()),
            MediaError::NoActiveMediaStream => CallError::NoActiveMediaStream,
            MediaError::Session(e) => CallError::Session(e),
            other => CallError::Media(other.to_string()),
        }
    }
}

// ============================================================================
// INTERNALS
// ============================================================================

/// Ereignisse aus Timern und Media Sessions
enum EngineInput {
    Call(CallInput),
    Session(SessionId, SessionEvent),
}

/// Warum eine Aktion nicht ausgeführt wurde
enum ActionError {
    /// Session ist nicht mehr aktiv, restliche Aktionen verwerfen
    Stale,
    /// Anrufaufbau gescheitert
    Failed(CallError),
}

/// Lokale ICE Candidates, die erst nach Offer bzw. Answer gesendet werden dürfen
#[derive(Default)]
struct OutboundCandidates {
    session_id: SessionId,
    released: bool,
    pending: Vec<IceCandidate>,
}

impl OutboundCandidates {
    fn for_session(&mut self, id: SessionId) -> &mut Self {
        if self.session_id != id {
            *self = Self {
                session_id: id,
                ..Default::default()
            };
        }
        self
    }
}

/// Vom Anruf gelöste Ressourcen, deren Abbau noch aussteht
struct Teardown {
    session_id: SessionId,
    media_session: Option<Arc<dyn MediaSession>>,
    media: ReleasedMedia,
}

struct Inner {
    machine: CallMachine,
    media_session: Option<(SessionId, Arc<dyn MediaSession>)>,
    outbound: OutboundCandidates,
    setup_timer: Option<JoinHandle<()>>,
    duration: Option<JoinHandle<()>>,
    teardowns: Vec<Teardown>,
}

impl Inner {
    /// Löst Timer, Candidates und Media Session der Session `id`
    fn detach(&mut self, id: SessionId, media: ReleasedMedia) {
        if let Some(timer) = self.setup_timer.take() {
            timer.abort();
        }
        if self.outbound.session_id == id {
            self.outbound = OutboundCandidates::default();
        }
        let media_session = match self.media_session.take() {
            Some((sid, session)) if sid == id => Some(session),
            other => {
                self.media_session = other;
                None
            }
        };
        self.teardowns.push(Teardown {
            session_id: id,
            media_session,
            media,
        });
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    local_user_id: String,
    inner: Mutex<Inner>,
    media: MediaController,
    factory: Arc<dyn MediaSessionFactory>,
    sink: Arc<dyn SignalingSink>,
    setup_timeout: Option<Duration>,
    event_tx: broadcast::Sender<CallEvent>,
    input_tx: mpsc::UnboundedSender<EngineInput>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn new(
        local_user_id: &str,
        local_name: &str,
        devices: Arc<dyn CaptureDevices>,
        factory: Arc<dyn MediaSessionFactory>,
        sink: Arc<dyn SignalingSink>,
        config: &CallConfig,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(100);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            local_user_id: local_user_id.to_string(),
            inner: Mutex::new(Inner {
                machine: CallMachine::new(local_user_id, local_name),
                media_session: None,
                outbound: OutboundCandidates::default(),
                setup_timer: None,
                duration: None,
                teardowns: Vec::new(),
            }),
            media: MediaController::new(devices, config.recordings_dir.clone()),
            factory,
            sink,
            setup_timeout: config.setup_timeout,
            event_tx,
            input_tx,
        });

        let weak = Arc::downgrade(&engine);
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.process(input).await;
            }
        });

        engine
    }

    /// CallEngine mit Systemgeräten und WebRTC
    pub fn with_system_media(
        local_user_id: &str,
        local_name: &str,
        sink: Arc<dyn SignalingSink>,
        config: &CallConfig,
    ) -> Arc<Self> {
        Self::new(
            local_user_id,
            local_name,
            Arc::new(SystemDevices::new()),
            Arc::new(WebRtcSessionFactory::new(&config.stun_urls)),
            sink,
            config,
        )
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.inner.lock().machine.state()
    }

    /// Aktueller Anrufversuch
    pub fn session(&self) -> Option<CallSession> {
        self.inner.lock().machine.session().cloned()
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub async fn dial(&self, to: &str, call_type: CallType) -> Result<(), CallError> {
        self.dial_in_room(to, call_type, None).await
    }

    /// Startet einen ausgehenden Anruf im Kontext eines Raums
    pub async fn dial_in_room(
        &self,
        to: &str,
        call_type: CallType,
        room_id: Option<String>,
    ) -> Result<(), CallError> {
        let transition = self
            .transition(CallInput::Dial {
                to: to.to_string(),
                call_type,
                room_id,
            })
            .ok_or(CallError::AlreadyInCall)?;
        self.execute(transition).await;
        Ok(())
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept(&self) -> Result<(), CallError> {
        self.user_action(CallInput::Accept).await
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn decline(&self) -> Result<(), CallError> {
        self.user_action(CallInput::Decline).await
    }

    /// Bricht einen ausgehenden Anruf ab, auch während der Gerätefreigabe
    pub async fn cancel(&self) -> Result<(), CallError> {
        self.user_action(CallInput::Cancel).await
    }

    /// Beendet den Anruf aus jedem aktiven Zustand
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.user_action(CallInput::Hangup).await
    }

    /// Kündigt allen anderen Mitgliedern eines Raums einen Gruppenanruf an
    ///
    /// Der lokale Zustand bleibt `Idle`; wer annimmt, ruft einzeln an.
    pub fn start_group_call(&self, room_id: &str, call_type: CallType) -> Result<(), CallError> {
        let from_name = self.inner.lock().machine.local_name().to_string();
        tracing::info!("Announcing {} group call in room {}", call_type, room_id);
        self.sink.send(ClientMessage::GroupCallStart {
            room_id: room_id.to_string(),
            from: self.local_user_id.clone(),
            from_name,
            call_type,
        })?;
        Ok(())
    }

    async fn user_action(&self, input: CallInput) -> Result<(), CallError> {
        let transition = self.transition(input).ok_or(CallError::NoActiveCall)?;
        self.execute(transition).await;
        Ok(())
    }

    // ========================================================================
    // MEDIA CONTROLS
    // ========================================================================

    pub fn toggle_mic(&self) -> Option<bool> {
        self.media.toggle_mic()
    }

    pub fn toggle_camera(&self) -> Option<bool> {
        self.media.toggle_camera()
    }

    /// Startet bzw. beendet das Teilen des Bildschirms im aktiven Anruf
    pub async fn share_screen(&self) -> Result<bool, CallError> {
        let session = self.active_media_session().ok_or(CallError::NoActiveCall)?;
        Ok(self.media.share_screen(session.as_ref()).await?)
    }

    /// Nimmt Remote-Tracks und das lokale Mikrofon auf
    pub async fn start_recording(&self) -> Result<(), CallError> {
        let remote = self
            .active_media_session()
            .map(|s| s.remote_tracks())
            .unwrap_or_default();

        if let Err(e) = self.media.start_recording(remote).await {
            let error = CallError::from(e);
            tracing::warn!("Recording not started: {}", error);
            self.emit(CallEvent::Error(error.clone()));
            return Err(error);
        }
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<PathBuf, CallError> {
        Ok(self.media.stop_recording().await?)
    }

    pub fn is_mic_enabled(&self) -> bool {
        self.media.is_mic_enabled()
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.media.is_camera_enabled()
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.media.is_sharing_screen()
    }

    pub fn is_recording(&self) -> bool {
        self.media.is_recording()
    }

    fn active_media_session(&self) -> Option<Arc<dyn MediaSession>> {
        let inner = self.inner.lock();
        if inner.machine.state() != CallState::Connected {
            return None;
        }
        let current = inner.machine.session()?.id;
        inner
            .media_session
            .as_ref()
            .filter(|(id, _)| *id == current)
            .map(|(_, session)| Arc::clone(session))
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    /// Verarbeitet eine Nachricht vom Relay
    pub async fn handle_server_message(&self, msg: ServerMessage) {
        let kind = msg.kind();
        let input = match msg {
            ServerMessage::IncomingCall {
                from,
                from_name,
                offer,
                call_type,
                room_id,
                is_group_call,
            } => CallInput::IncomingCall {
                from,
                from_name,
                offer,
                call_type,
                room_id,
                is_group_call,
            },
            ServerMessage::CallAnswered { from, answer } => CallInput::AnswerReceived { from, answer },
            ServerMessage::CallRejected { from, reason } => CallInput::Rejected { from, reason },
            ServerMessage::IceCandidate { from, candidate } => {
                CallInput::RemoteCandidate { from, candidate }
            }
            ServerMessage::CallEnded { from } => CallInput::RemoteEnded { from },
            ServerMessage::CallFailed { reason, to } => CallInput::CallFailed { reason, to },
            ServerMessage::Registered { .. } | ServerMessage::Pong => return,
        };

        if !self.drive(input).await {
            tracing::debug!("Ignored {} in state {:?}", kind, self.state());
        }
    }

    /// Verarbeitet Events eines SignalingClients bis dieser geschlossen wird
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<SignalingEvent>) {
        loop {
            match events.recv().await {
                Ok(SignalingEvent::Received(msg)) => self.handle_server_message(msg).await,
                Ok(SignalingEvent::Disconnected) => {
                    tracing::warn!("Signaling disconnected in state {:?}", self.state());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Verpasste Answer/Candidates/End-Call lassen sich nicht nachholen
                    tracing::warn!("Call engine lagged behind signaling by {} event(s)", skipped);
                    if self.drive(CallInput::SignalingLost).await {
                        tracing::warn!("Ended call after losing signaling messages");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn process(&self, input: EngineInput) {
        match input {
            EngineInput::Call(input) => {
                self.drive(input).await;
            }
            EngineInput::Session(id, event) => self.on_session_event(id, event).await,
        }
    }

    async fn on_session_event(&self, id: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::LocalCandidate(candidate) => self.send_local_candidate(id, candidate),
            SessionEvent::TransportChanged(state) if state.is_lost() => {
                tracing::warn!("Media transport {:?} for session {}", state, id);
                self.drive(CallInput::TransportLost { id }).await;
            }
            SessionEvent::TransportChanged(TransportState::Connected) => {
                tracing::info!("Media transport established for session {}", id);
            }
            SessionEvent::TransportChanged(_) => {}
            SessionEvent::RemoteTrack(track) => {
                if self.inner.lock().machine.is_current(id) {
                    self.emit(CallEvent::RemoteTrack(track));
                }
            }
        }
    }

    fn send_local_candidate(&self, id: SessionId, candidate: IceCandidate) {
        let mut inner = self.inner.lock();
        let Some(to) = inner
            .machine
            .session()
            .filter(|s| s.id == id)
            .map(|s| s.remote_user_id.clone())
        else {
            return;
        };

        let outbound = inner.outbound.for_session(id);
        if outbound.released {
            if let Err(e) = self.sink.send(ClientMessage::IceCandidate { to, candidate }) {
                tracing::warn!("Failed to send ICE candidate: {}", e);
            }
        } else {
            outbound.pending.push(candidate);
        }
    }

    /// Wendet ein Ereignis an und meldet Zustandswechsel
    ///
    /// Enthält der Übergang `ReleaseMedia`, sind Geräte und Media Session
    /// bereits gelöst, bevor der neue Zustand sichtbar wird.
    fn transition(&self, input: CallInput) -> Option<Transition> {
        let transition = {
            let mut inner = self.inner.lock();
            let transition = inner.machine.apply(input)?;
            if transition
                .actions
                .iter()
                .any(|a| matches!(a, CallAction::ReleaseMedia))
            {
                let media = self.media.detach_all();
                inner.detach(transition.session_id, media);
            }
            transition
        };
        if transition.changed {
            tracing::info!("Call session {} is now {:?}", transition.session_id, transition.state);
            self.emit(CallEvent::StateChanged(transition.state));
        }
        Some(transition)
    }

    /// Wendet ein Ereignis an und führt die Aktionen aus; `false` wenn ignoriert
    async fn drive(&self, input: CallInput) -> bool {
        match self.transition(input) {
            Some(transition) => {
                self.execute(transition).await;
                true
            }
            None => false,
        }
    }

    async fn execute(&self, transition: Transition) {
        let id = transition.session_id;
        let mut queue: VecDeque<CallAction> = transition.actions.into();

        while let Some(action) = queue.pop_front() {
            match self.run_action(id, action).await {
                Ok(follow_up) => queue.extend(follow_up),
                Err(ActionError::Stale) => {
                    tracing::debug!("Session {} superseded, dropping remaining actions", id);
                    break;
                }
                Err(ActionError::Failed(error)) => {
                    tracing::warn!("Call setup for session {} failed: {}", id, error);
                    queue.clear();
                    if let Some(t) = self.transition(CallInput::MediaFailed { id, error }) {
                        queue.extend(t.actions);
                    }
                }
            }
        }
    }

    async fn run_action(&self, id: SessionId, action: CallAction) -> Result<Vec<CallAction>, ActionError> {
        match action {
            CallAction::ArmSetupTimer => {
                if let Some(timeout) = self.setup_timeout {
                    let input_tx = self.input_tx.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = input_tx.send(EngineInput::Call(CallInput::SetupTimeout { id }));
                    });
                    let mut inner = self.inner.lock();
                    if !inner.machine.is_current(id) {
                        timer.abort();
                        return Err(ActionError::Stale);
                    }
                    if let Some(old) = inner.setup_timer.replace(timer) {
                        old.abort();
                    }
                }
            }

            CallAction::AcquireTracks(call_type) => match self.media.acquire_tracks(call_type).await {
                Ok(_) => {}
                Err(MediaError::Cancelled) => return Err(ActionError::Stale),
                Err(e) => return Err(ActionError::Failed(e.into())),
            },

            CallAction::SendOffer {
                to,
                from_name,
                call_type,
                room_id,
            } => {
                let session = self.open_session(id).await?;
                let offer = session
                    .create_offer(&self.media.local_tracks())
                    .await
                    .map_err(|e| ActionError::Failed(e.into()))?;
                self.send_current(
                    id,
                    ClientMessage::CallUser {
                        to,
                        from: self.local_user_id.clone(),
                        from_name,
                        offer,
                        call_type,
                        room_id,
                    },
                )?;
            }

            CallAction::SendAnswer { to, offer } => {
                let session = self.open_session(id).await?;
                let answer = session
                    .accept_offer(&offer, &self.media.local_tracks())
                    .await
                    .map_err(|e| ActionError::Failed(e.into()))?;
                self.send_current(id, ClientMessage::CallAccepted { to, answer })?;
                return Ok(self.follow_up(CallInput::MediaReady { id }));
            }

            CallAction::SurfaceIncoming {
                from,
                from_name,
                call_type,
                room_id,
                is_group_call,
            } => {
                tracing::info!("Incoming {} call from {} (group: {})", call_type, from, is_group_call);
                self.emit(CallEvent::IncomingCall {
                    from,
                    from_name,
                    call_type,
                    room_id,
                    is_group_call,
                });
            }

            CallAction::ApplyAnswer(answer) => {
                let session = self.media_session_for(id)?;
                session
                    .apply_answer(&answer)
                    .await
                    .map_err(|e| ActionError::Failed(e.into()))?;
                return Ok(self.follow_up(CallInput::MediaReady { id }));
            }

            CallAction::ApplyCandidate(candidate) => {
                let session = self.media_session_for(id)?;
                if let Err(e) = session.add_ice_candidate(&candidate).await {
                    tracing::warn!("Failed to apply remote ICE candidate: {}", e);
                }
            }

            CallAction::Send(msg) => {
                if let Err(e) = self.sink.send(msg) {
                    tracing::warn!("Failed to send signaling message: {}", e);
                }
            }

            CallAction::ReleaseMedia => self.finish_teardowns().await,

            CallAction::StartDuration => {
                let mut inner = self.inner.lock();
                if !inner.machine.is_current(id) {
                    return Err(ActionError::Stale);
                }
                if let Some(timer) = inner.setup_timer.take() {
                    timer.abort();
                }
                let event_tx = self.event_tx.clone();
                let ticker = tokio::spawn(async move {
                    let started = Instant::now();
                    let mut interval = tokio::time::interval(Duration::from_secs(1));
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        let _ = event_tx.send(CallEvent::DurationTick {
                            seconds: started.elapsed().as_secs(),
                        });
                    }
                });
                if let Some(old) = inner.duration.replace(ticker) {
                    old.abort();
                }
            }

            CallAction::StopDuration => {
                if let Some(ticker) = self.inner.lock().duration.take() {
                    ticker.abort();
                }
            }

            CallAction::Notify(error) => {
                tracing::warn!("Call error: {}", error);
                self.emit(CallEvent::Error(error));
            }
        }

        Ok(Vec::new())
    }

    /// Erstellt die Media Session für `id` und leitet ihre Events weiter
    async fn open_session(&self, id: SessionId) -> Result<Arc<dyn MediaSession>, ActionError> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = self
            .factory
            .create(events_tx)
            .await
            .map_err(|e| ActionError::Failed(e.into()))?;

        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if input_tx.send(EngineInput::Session(id, event)).is_err() {
                    break;
                }
            }
        });

        let stored = {
            let mut inner = self.inner.lock();
            if inner.machine.is_current(id) {
                inner.media_session = Some((id, Arc::clone(&session)));
                true
            } else {
                false
            }
        };

        if !stored {
            session.close().await;
            return Err(ActionError::Stale);
        }
        Ok(session)
    }

    fn media_session_for(&self, id: SessionId) -> Result<Arc<dyn MediaSession>, ActionError> {
        self.inner
            .lock()
            .media_session
            .as_ref()
            .filter(|(sid, _)| *sid == id)
            .map(|(_, session)| Arc::clone(session))
            .ok_or(ActionError::Stale)
    }

    /// Sendet Offer bzw. Answer, sofern die Session noch aktiv ist, und
    /// gibt danach die zurückgehaltenen lokalen Candidates frei
    fn send_current(&self, id: SessionId, msg: ClientMessage) -> Result<(), ActionError> {
        let mut inner = self.inner.lock();
        let to = match inner.machine.session() {
            Some(s) if s.id == id => s.remote_user_id.clone(),
            _ => return Err(ActionError::Stale),
        };

        self.sink
            .send(msg)
            .map_err(|e| ActionError::Failed(e.into()))?;

        let outbound = inner.outbound.for_session(id);
        outbound.released = true;
        for candidate in outbound.pending.drain(..) {
            if let Err(e) = self.sink.send(ClientMessage::IceCandidate {
                to: to.clone(),
                candidate,
            }) {
                tracing::warn!("Failed to send ICE candidate: {}", e);
            }
        }
        Ok(())
    }

    fn follow_up(&self, input: CallInput) -> Vec<CallAction> {
        self.transition(input).map(|t| t.actions).unwrap_or_default()
    }

    /// Schließt gelöste Media Sessions und die Aufnahmedateien ab
    async fn finish_teardowns(&self) {
        let teardowns = std::mem::take(&mut self.inner.lock().teardowns);
        for teardown in teardowns {
            tracing::debug!("Finishing teardown of session {}", teardown.session_id);
            if let Some(session) = teardown.media_session {
                session.close().await;
            }
            teardown.media.finish().await;
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("user_id", &self.local_user_id)
            .field("state", &self.state())
            .field("media", &self.media)
            .finish()
    }
}
