//! Media Session (WebRTC)
//!
//! [`MediaSession`] kapselt die Peer Connection eines Anrufs: Offer/Answer,
//! ICE Candidates, Austausch des ausgehenden Video-Tracks und die vom Peer
//! empfangenen Tracks. [`WebRtcSession`] setzt das mit dem `webrtc`-Crate um.

use super::tracks::{LocalTracks, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::devices::{CHANNELS, SAMPLE_RATE};

/// Stream-ID aller lokalen Tracks
const STREAM_ID: &str = "pulse";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No outgoing video channel to replace")]
    NoVideoChannel,

    #[error("Media session closed")]
    Closed,
}

fn webrtc_err(e: webrtc::Error) -> SessionError {
    SessionError::WebRtc(e.to_string())
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Zustand des Media-Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Transport ist verloren, der Anruf muss abgebaut werden
    pub fn is_lost(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

/// Events einer Media Session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Lokaler ICE Candidate, muss an den Peer gehen
    LocalCandidate(IceCandidate),

    TransportChanged(TransportState),

    /// Neuer Track vom Peer
    RemoteTrack(Arc<MediaTrack>),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine Peer Connection für genau einen Anruf
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Fügt die lokalen Tracks hinzu und erzeugt das Offer
    async fn create_offer(&self, local: &LocalTracks) -> Result<SessionDescription, SessionError>;

    /// Übernimmt das Offer des Peers, fügt die lokalen Tracks hinzu und erzeugt das Answer
    async fn accept_offer(
        &self,
        offer: &SessionDescription,
        local: &LocalTracks,
    ) -> Result<SessionDescription, SessionError>;

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), SessionError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError>;

    /// Ersetzt die Quelle des ausgehenden Video-Kanals ohne Neuverhandlung
    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), SessionError>;

    fn remote_tracks(&self) -> Vec<Arc<MediaTrack>>;

    async fn close(&self);
}

/// Erzeugt Media Sessions; Events gehen an `events`
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn MediaSession>, SessionError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// ICE-Server aus einer Liste von STUN/TURN-URLs
pub fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

pub struct WebRtcSessionFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcSessionFactory {
    pub fn new(stun_urls: &[String]) -> Self {
        Self {
            ice_servers: ice_servers(stun_urls),
        }
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl MediaSessionFactory for WebRtcSessionFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn MediaSession>, SessionError> {
        let pc = self.create_peer_connection().await?;
        let session = Arc::new(WebRtcSession {
            pc,
            video_sender: Mutex::new(None),
            video_pump: Mutex::new(None),
            pumps: Mutex::new(Vec::new()),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
        });
        session.setup_handlers(events);
        Ok(session)
    }
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    video_pump: Mutex<Option<JoinHandle<()>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    remote_tracks: Arc<Mutex<Vec<Arc<MediaTrack>>>>,
}

impl WebRtcSession {
    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self, events: mpsc::UnboundedSender<SessionEvent>) {
        let events_clone = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                let _ = events_clone.send(SessionEvent::TransportChanged(s.into()));
                Box::pin(async {})
            }));

        let events_clone = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            let _ = events_clone.send(SessionEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
                let remote_tracks = Arc::clone(&remote_tracks);
                let events = events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    tracing::info!("Received {:?} track: {:?}", kind, track.codec().capability.mime_type);

                    let media = MediaTrack::remote(track.id(), kind);
                    remote_tracks.lock().push(Arc::clone(&media));
                    let _ = events.send(SessionEvent::RemoteTrack(Arc::clone(&media)));

                    let feed = media.feed();
                    tokio::spawn(async move {
                        while let Ok((packet, _)) = track.read_rtp().await {
                            feed.publish(packet.payload, Duration::ZERO);
                        }
                    });
                })
            }));
    }

    /// Fügt die lokalen Tracks der Peer Connection hinzu
    async fn add_local_tracks(&self, local: &LocalTracks) -> Result<(), SessionError> {
        if let Some(audio) = &local.audio {
            // TODO: PCM-Frames vor dem Senden mit Opus kodieren
            let sample_track = sample_track(TrackKind::Audio);
            let sender = self
                .pc
                .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;
            let mut pumps = self.pumps.lock();
            pumps.push(drain_rtcp(sender));
            pumps.push(spawn_pump(audio, sample_track));
        }

        if let Some(video) = &local.video {
            let sample_track = sample_track(TrackKind::Video);
            let sender = self
                .pc
                .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;
            self.pumps.lock().push(drain_rtcp(Arc::clone(&sender)));
            *self.video_sender.lock() = Some(sender);
            if let Some(old) = self.video_pump.lock().replace(spawn_pump(video, sample_track)) {
                old.abort();
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn create_offer(&self, local: &LocalTracks) -> Result<SessionDescription, SessionError> {
        self.add_local_tracks(local).await?;

        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
        local: &LocalTracks,
    ) -> Result<SessionDescription, SessionError> {
        if offer.kind != SdpType::Offer {
            return Err(SessionError::InvalidSdp("expected an offer".to_string()));
        }
        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| SessionError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(webrtc_err)?;

        // Nach dem Offer hinzufügen, damit die Transceiver des Peers genutzt werden
        self.add_local_tracks(local).await?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), SessionError> {
        if answer.kind != SdpType::Answer {
            return Err(SessionError::InvalidSdp("expected an answer".to_string()));
        }
        let remote = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| SessionError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), SessionError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or(SessionError::NoVideoChannel)?;

        let sample_track = sample_track(TrackKind::Video);
        sender
            .replace_track(Some(
                Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .map_err(webrtc_err)?;

        if let Some(old) = self.video_pump.lock().replace(spawn_pump(&track, sample_track)) {
            old.abort();
        }
        tracing::debug!("Outgoing video now fed by {:?} track", track.source());
        Ok(())
    }

    fn remote_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.remote_tracks.lock().clone()
    }

    async fn close(&self) {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
        if let Some(pump) = self.video_pump.lock().take() {
            pump.abort();
        }
        *self.video_sender.lock() = None;

        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }

        for track in self.remote_tracks.lock().drain(..) {
            track.stop();
        }
    }
}

fn sample_track(kind: TrackKind) -> Arc<TrackLocalStaticSample> {
    let (codec, id) = match kind {
        TrackKind::Audio => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio",
        ),
        TrackKind::Video => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video",
        ),
    };
    Arc::new(TrackLocalStaticSample::new(
        codec,
        id.to_string(),
        STREAM_ID.to_string(),
    ))
}

/// Schreibt die Chunks eines lokalen Tracks in den WebRTC-Track
fn spawn_pump(track: &MediaTrack, sample_track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut rx = track.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(chunk) => {
                    let sample = Sample {
                        data: chunk.payload,
                        duration: chunk.duration,
                        ..Default::default()
                    };
                    if let Err(e) = sample_track.write_sample(&sample).await {
                        tracing::debug!("Dropping sample: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Sender fell behind, {} chunk(s) skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// RTCP-Pakete müssen gelesen werden, damit die Interceptors arbeiten
fn drain_rtcp(sender: Arc<RTCRtpSender>) -> JoinHandle<()> {
    tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} })
}
