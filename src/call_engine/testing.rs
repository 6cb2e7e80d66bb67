//! Test-Doubles für Geräte, Media Session und Signaling

use super::devices::{CaptureDevices, DeviceError};
use super::peer::{MediaSession, MediaSessionFactory, SessionError, SessionEvent};
use super::tracks::{CaptureHandle, LocalTracks, MediaTrack, TrackFeed, TrackKind, TrackSource};
use crate::relay::{ConnectionContext, ConnectionHandle, Relay};
use crate::signaling::{
    ClientMessage, IceCandidate, ServerMessage, SessionDescription, SignalingError, SignalingSink,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// ============================================================================
// DEVICES
// ============================================================================

/// Zählt geöffnete und gestoppte Geräte
pub struct FakeDevices {
    opened: AtomicUsize,
    stopped: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    deny_microphone: AtomicBool,
    deny_camera: AtomicBool,
    approval: watch::Sender<bool>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        let (approval, _) = watch::channel(true);
        Arc::new(Self {
            opened: AtomicUsize::new(0),
            stopped: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
            deny_microphone: AtomicBool::new(false),
            deny_camera: AtomicBool::new(false),
            approval,
        })
    }

    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }

    pub fn deny_camera(&self) {
        self.deny_camera.store(true, Ordering::SeqCst);
    }

    pub fn allow_all(&self) {
        self.deny_microphone.store(false, Ordering::SeqCst);
        self.deny_camera.store(false, Ordering::SeqCst);
    }

    /// Folgende Anforderungen warten, bis [`grant_approval`](Self::grant_approval) läuft
    pub fn hold_approval(&self) {
        self.approval.send_replace(false);
    }

    pub fn grant_approval(&self) {
        self.approval.send_replace(true);
    }

    /// Anforderungen, die gerade auf Freigabe warten
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Geöffnete, aber nicht gestoppte Geräte
    pub fn outstanding(&self) -> usize {
        self.opened() - self.stopped()
    }

    async fn open(&self, deny: &AtomicBool, what: &str) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let mut approval = self.approval.subscribe();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _ = approval.wait_for(|granted| *granted).await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        if deny.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied(what.to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture(Arc::clone(&self.stopped))))
    }
}

struct FakeCapture(Arc<AtomicUsize>);

impl CaptureHandle for FakeCapture {
    fn stop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureDevices for FakeDevices {
    async fn open_microphone(&self, _feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        self.open(&self.deny_microphone, "microphone").await
    }

    async fn open_camera(&self, _feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        self.open(&self.deny_camera, "camera").await
    }

    async fn open_screen(&self, _feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        self.open(&AtomicBool::new(false), "screen").await
    }
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

/// Zeichnet alle Aufrufe auf und erzeugt Platzhalter-SDP
pub struct FakeSession {
    calls: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    video: Mutex<Option<TrackSource>>,
    has_video_channel: Mutex<bool>,
    remote: Mutex<Vec<Arc<MediaTrack>>>,
    closed: AtomicBool,
}

impl FakeSession {
    /// Session mit eigenem Event-Kanal; `video` legt einen Video-Kanal an
    pub fn new(video: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self::with_events(tx);
        if video {
            *session.has_video_channel.lock() = true;
            *session.video.lock() = Some(TrackSource::Camera);
        }
        (session, rx)
    }

    fn with_events(events: mpsc::UnboundedSender<SessionEvent>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            events,
            video: Mutex::new(None),
            has_video_channel: Mutex::new(false),
            remote: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Quelle des ausgehenden Video-Kanals
    pub fn video_source(&self) -> Option<TrackSource> {
        *self.video.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simuliert einen vom Peer empfangenen Track
    pub fn add_remote_track(&self, kind: TrackKind) -> Arc<MediaTrack> {
        let track = MediaTrack::remote(format!("remote-{:?}", kind).to_lowercase(), kind);
        self.remote.lock().push(Arc::clone(&track));
        let _ = self.events.send(SessionEvent::RemoteTrack(Arc::clone(&track)));
        track
    }

    /// Schickt ein beliebiges Session-Event an die Engine
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: impl Into<String>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.calls.lock().push(call.into());
        Ok(())
    }

    fn attach(&self, local: &LocalTracks) {
        if let Some(video) = &local.video {
            *self.has_video_channel.lock() = true;
            *self.video.lock() = Some(video.source());
        }
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn create_offer(&self, local: &LocalTracks) -> Result<SessionDescription, SessionError> {
        self.record("create_offer")?;
        self.attach(local);
        // Candidates entstehen schon vor dem Versand des Offers
        self.emit(SessionEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:caller".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
        local: &LocalTracks,
    ) -> Result<SessionDescription, SessionError> {
        self.record(format!("accept_offer:{}", offer.sdp))?;
        self.attach(local);
        self.emit(SessionEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:callee".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), SessionError> {
        self.record(format!("apply_answer:{}", answer.sdp))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.record(format!("candidate:{}", candidate.candidate))
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), SessionError> {
        if !*self.has_video_channel.lock() {
            return Err(SessionError::NoVideoChannel);
        }
        self.record(format!("replace:{:?}", track.source()))?;
        *self.video.lock() = Some(track.source());
        Ok(())
    }

    fn remote_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.remote.lock().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for track in self.remote.lock().drain(..) {
            track.stop();
        }
    }
}

/// Liefert [`FakeSession`]s und merkt sich alle erzeugten
#[derive(Default)]
pub struct FakeSessionFactory {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeSessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl MediaSessionFactory for FakeSessionFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn MediaSession>, SessionError> {
        let session = FakeSession::with_events(events);
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Sammelt gesendete Nachrichten
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<ClientMessage>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.kind()).collect()
    }
}

impl SignalingSink for RecordingSink {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(msg);
        Ok(())
    }
}

/// Verbindung eines Benutzers zu einem [`Relay`] ohne WebSocket
pub struct RelayLink {
    relay: Arc<Relay>,
    conn: Mutex<ConnectionContext>,
}

impl RelayLink {
    /// Registriert `user_id` und liefert den Link samt Empfangskanal
    pub fn connect(relay: &Arc<Relay>, user_id: &str) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(64);
        let mut conn = ConnectionContext::new(ConnectionHandle::new(tx));
        relay.handle(
            &mut conn,
            ClientMessage::Register {
                user_id: user_id.to_string(),
            },
        );
        // `registered` gehört nicht zum Anrufablauf
        let _ = rx.try_recv();
        let link = Arc::new(Self {
            relay: Arc::clone(relay),
            conn: Mutex::new(conn),
        });
        (link, rx)
    }

    pub fn disconnect(&self) {
        self.relay.disconnect(&self.conn.lock());
    }
}

impl SignalingSink for RelayLink {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.relay.handle(&mut self.conn.lock(), msg);
        Ok(())
    }
}
