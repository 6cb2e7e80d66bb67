//! Call Engine Module - Anrufsteuerung, WebRTC und lokale Medien
//!
//! Dieses Modul verwaltet:
//! - Den Zustandsautomaten eines Anrufversuchs
//! - WebRTC Peer Connections (Offer/Answer, ICE, Remote Tracks)
//! - Mikrofon, Kamera und Bildschirm als Tracks
//! - Aufnahme der Remote-Streams in eine Datei

mod devices;
mod engine;
mod media;
mod peer;
mod recorder;
mod session;
mod tracks;

#[cfg(test)]
pub(crate) mod testing;

pub use devices::{
    AudioDevice, CaptureDevices, DeviceError, SystemDevices, CHANNELS, FRAME_SIZE, SAMPLE_RATE,
};
pub use engine::{CallEngine, CallEvent};
pub use media::{MediaController, MediaError, ReleasedMedia};
pub use peer::{
    ice_servers, MediaSession, MediaSessionFactory, SessionError, SessionEvent, TransportState,
    WebRtcSession, WebRtcSessionFactory,
};
pub use recorder::{
    ActiveRecording, RecorderError, RECORDING_EXTENSION, RECORDING_MAGIC, RECORDING_VERSION,
};
pub use session::{
    CallAction, CallError, CallInput, CallMachine, CallSession, CallState, SessionId, Transition,
    REASON_BUSY, REASON_DECLINED, REASON_MEDIA_UNAVAILABLE, REASON_TIMEOUT,
};
pub use tracks::{
    CaptureHandle, LocalTracks, MediaChunk, MediaTrack, TrackFeed, TrackKind, TrackSource,
};
