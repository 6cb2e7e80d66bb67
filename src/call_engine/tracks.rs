//! Media Tracks
//!
//! Ein [`MediaTrack`] ist eine Audio- oder Videoquelle (lokal oder vom
//! Peer). Die Quelle schreibt über einen [`TrackFeed`] Chunks hinein,
//! Konsumenten (WebRTC-Sender, Aufnahme) abonnieren sie.
//!
//! [`MediaTrack::copy`] liefert einen zweiten Track derselben Quelle mit
//! eigenem Enabled-Flag. Stummschalten des Originals betrifft die Kopie nicht.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Puffer pro Track für Abonnenten, die kurz hinterherhängen
const CHUNK_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    Remote,
}

/// Ein Stück Mediendaten (PCM-Frame, kodierter Frame oder RTP-Payload)
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub track_id: Arc<str>,
    pub kind: TrackKind,
    pub payload: Bytes,
    pub duration: Duration,
}

/// Laufende Aufnahme eines Geräts; `stop` gibt die Hardware frei
pub trait CaptureHandle: Send {
    fn stop(&mut self);
}

// ============================================================================
// TRACK FEED
// ============================================================================

/// Schreibende Seite eines Tracks, wird an die Capture-Quelle übergeben
#[derive(Clone)]
pub struct TrackFeed {
    track_id: Arc<str>,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    /// false sobald der Track gestoppt ist
    live: Arc<AtomicBool>,
    chunks: broadcast::Sender<MediaChunk>,
    copies: Arc<Mutex<Vec<TrackFeed>>>,
}

impl TrackFeed {
    /// Veröffentlicht einen Chunk; deaktivierte Tracks verwerfen ihn
    ///
    /// Kopien bekommen den Chunk unabhängig vom eigenen Enabled-Flag,
    /// gestoppte Kopien fallen dabei heraus.
    pub fn publish(&self, payload: Bytes, duration: Duration) -> bool {
        {
            let mut copies = self.copies.lock();
            if !copies.is_empty() {
                copies.retain(|copy| copy.live.load(Ordering::Acquire));
                for copy in copies.iter() {
                    copy.publish(payload.clone(), duration);
                }
            }
        }

        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        self.chunks
            .send(MediaChunk {
                track_id: Arc::clone(&self.track_id),
                kind: self.kind,
                payload,
                duration,
            })
            .is_ok()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

pub struct MediaTrack {
    id: Arc<str>,
    source: TrackSource,
    kind: TrackKind,
    feed: TrackFeed,
    stopped: AtomicBool,
    capture: Mutex<Option<Box<dyn CaptureHandle>>>,
}

impl MediaTrack {
    /// Neuer lokaler Track für eine Gerätequelle
    pub fn local(source: TrackSource) -> Arc<Self> {
        let kind = match source {
            TrackSource::Microphone => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self::build(Uuid::new_v4().to_string(), source, kind)
    }

    /// Track, den der Peer sendet
    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Self::build(id.into(), TrackSource::Remote, kind)
    }

    /// Zweiter Track, der dieselben Chunks bekommt
    ///
    /// Die Kopie hat ein eigenes Enabled-Flag und hält kein Gerät. Stoppen
    /// der Kopie lässt das Original weiterlaufen.
    pub fn copy(&self) -> Arc<Self> {
        let copy = Self::build(format!("{}-copy", self.id), self.source, self.kind);
        if !self.is_stopped() {
            self.feed.copies.lock().push(copy.feed());
        }
        copy
    }

    fn build(id: String, source: TrackSource, kind: TrackKind) -> Arc<Self> {
        let id: Arc<str> = Arc::from(id);
        let (chunks, _) = broadcast::channel(CHUNK_BUFFER);
        Arc::new(Self {
            feed: TrackFeed {
                track_id: Arc::clone(&id),
                kind,
                enabled: Arc::new(AtomicBool::new(true)),
                live: Arc::new(AtomicBool::new(true)),
                chunks,
                copies: Arc::new(Mutex::new(Vec::new())),
            },
            id,
            source,
            kind,
            stopped: AtomicBool::new(false),
            capture: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn feed(&self) -> TrackFeed {
        self.feed.clone()
    }

    /// Verknüpft die Gerätequelle, die beim Stoppen freigegeben wird
    pub fn attach_capture(&self, handle: Box<dyn CaptureHandle>) {
        *self.capture.lock() = Some(handle);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaChunk> {
        self.feed.chunks.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.feed.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.feed.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Kehrt das Enabled-Flag um und gibt den neuen Wert zurück
    pub fn toggle(&self) -> bool {
        !self.feed.enabled.fetch_xor(true, Ordering::Relaxed)
    }

    /// Stoppt den Track und gibt das Gerät frei
    ///
    /// Gibt `true` zurück, wenn dieser Aufruf den Track gestoppt hat.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(mut handle) = self.capture.lock().take() {
            handle.stop();
        }
        self.set_enabled(false);
        self.feed.live.store(false, Ordering::Release);
        self.feed.copies.lock().clear();
        tracing::debug!("Stopped {:?} track {}", self.source, self.id);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        if let Some(mut handle) = self.capture.get_mut().take() {
            tracing::warn!("{:?} track {} dropped without stop", self.source, self.id);
            handle.stop();
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Lokale Tracks, die in eine Media Session eingebracht werden
#[derive(Debug, Clone, Default)]
pub struct LocalTracks {
    pub audio: Option<Arc<MediaTrack>>,
    pub video: Option<Arc<MediaTrack>>,
}

impl LocalTracks {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingCapture(Arc<AtomicUsize>);

    impl CaptureHandle for CountingCapture {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_toggle_is_an_involution() {
        let track = MediaTrack::local(TrackSource::Microphone);
        assert!(track.is_enabled());
        assert!(!track.toggle());
        assert!(track.toggle());
        assert!(track.is_enabled());
    }

    #[test]
    fn test_disabled_track_drops_chunks() {
        let track = MediaTrack::local(TrackSource::Camera);
        let mut rx = track.subscribe();
        let feed = track.feed();

        assert!(feed.publish(Bytes::from_static(b"a"), Duration::from_millis(20)));
        track.set_enabled(false);
        assert!(!feed.publish(Bytes::from_static(b"b"), Duration::from_millis(20)));

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.payload, Bytes::from_static(b"a"));
        assert_eq!(chunk.kind, TrackKind::Video);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_releases_capture_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let track = MediaTrack::local(TrackSource::Microphone);
        track.attach_capture(Box::new(CountingCapture(Arc::clone(&stops))));

        assert!(track.stop());
        assert!(!track.stop());
        drop(track);

        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_copy_keeps_receiving_while_original_is_muted() {
        let track = MediaTrack::local(TrackSource::Microphone);
        let copy = track.copy();
        let mut original_rx = track.subscribe();
        let mut copy_rx = copy.subscribe();
        let feed = track.feed();

        track.set_enabled(false);
        assert!(!feed.publish(Bytes::from_static(b"muted"), Duration::from_millis(20)));

        assert!(original_rx.try_recv().is_err());
        let chunk = copy_rx.try_recv().unwrap();
        assert_eq!(chunk.payload, Bytes::from_static(b"muted"));
        assert_eq!(&*chunk.track_id, copy.id());
        assert_eq!(copy.kind(), TrackKind::Audio);
        assert!(copy.is_enabled());
    }

    #[test]
    fn test_stopped_copy_is_detached_from_source() {
        let stops = Arc::new(AtomicUsize::new(0));
        let track = MediaTrack::local(TrackSource::Microphone);
        track.attach_capture(Box::new(CountingCapture(Arc::clone(&stops))));
        let copy = track.copy();
        let mut copy_rx = copy.subscribe();
        let feed = track.feed();

        assert!(copy.stop());
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert!(!track.is_stopped());

        assert!(feed.publish(Bytes::from_static(b"a"), Duration::from_millis(20)));
        assert!(copy_rx.try_recv().is_err());
        assert!(track.feed.copies.lock().is_empty());

        track.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
