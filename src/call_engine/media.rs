//! Media Track Controller
//!
//! Besitzt die lokalen Aufnahmegeräte eines Anrufs:
//! - Mikrofon und (bei Videoanrufen) Kamera anfordern
//! - Mikrofon/Kamera stumm schalten
//! - Bildschirm teilen, indem der ausgehende Video-Track getauscht wird
//! - Aufnahme aus Remote-Tracks und einer Kopie des lokalen Audios
//!
//! Beim Abbau eines Anrufs muss [`MediaController::release_all`] (oder
//! [`detach_all`](MediaController::detach_all) mit anschließendem
//! [`ReleasedMedia::finish`]) laufen, sonst bleiben Kamera und Mikrofon belegt.

use super::devices::{CaptureDevices, DeviceError};
use super::peer::{MediaSession, SessionError};
use super::recorder::{ActiveRecording, RecorderError};
use super::tracks::{LocalTracks, MediaTrack, TrackSource};
use crate::signaling::CallType;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media permission denied: {0}")]
    MediaPermissionDenied(DeviceError),

    #[error("Capture devices are already in use by another call")]
    DevicesBusy,

    #[error("Media acquisition was cancelled")]
    Cancelled,

    #[error("No active media stream to record")]
    NoActiveMediaStream,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Media session error: {0}")]
    Session(#[from] SessionError),

    #[error("Recording error: {0}")]
    Recorder(#[from] RecorderError),
}

// ============================================================================
// TRACK SET
// ============================================================================

#[derive(Default)]
struct TrackSet {
    audio: Option<Arc<MediaTrack>>,
    /// Aktiver ausgehender Video-Track (Kamera oder Bildschirm)
    video: Option<Arc<MediaTrack>>,
    /// Kamera, solange der Bildschirm geteilt wird
    saved_camera: Option<Arc<MediaTrack>>,
    acquiring: bool,
    /// Wird bei jedem Freigeben erhöht; laufende Anforderungen erkennen so,
    /// dass sie inzwischen überholt sind
    epoch: u64,
}

impl TrackSet {
    fn is_sharing(&self) -> bool {
        self.video
            .as_ref()
            .is_some_and(|t| t.source() == TrackSource::Screen)
    }

    fn camera(&self) -> Option<&Arc<MediaTrack>> {
        if self.is_sharing() {
            self.saved_camera.as_ref()
        } else {
            self.video.as_ref()
        }
    }
}

// ============================================================================
// RECORDING
// ============================================================================

/// Laufende Aufnahme mit eigener Kopie des Mikrofons
///
/// Die Kopie ist vom Stummschalten des gesendeten Tracks unabhängig.
struct Recording {
    active: ActiveRecording,
    audio_copy: Option<Arc<MediaTrack>>,
}

impl Recording {
    async fn finish(self) -> Result<PathBuf, RecorderError> {
        if let Some(copy) = &self.audio_copy {
            copy.stop();
        }
        self.active.stop().await
    }
}

/// Vom Controller gelöste Medien eines beendeten Anrufs
///
/// Die Geräte sind bereits freigegeben; [`finish`](Self::finish) schließt
/// noch die Aufnahmedatei ab.
#[must_use]
pub struct ReleasedMedia {
    stopped: usize,
    recording: Option<Recording>,
}

impl ReleasedMedia {
    pub fn is_empty(&self) -> bool {
        self.stopped == 0 && self.recording.is_none()
    }

    pub async fn finish(self) {
        if self.stopped > 0 {
            tracing::info!("Released {} local track(s)", self.stopped);
        }
        if let Some(recording) = self.recording {
            match recording.finish().await {
                Ok(path) => tracing::info!("Recording saved to {:?}", path),
                Err(e) => tracing::error!("Failed to finalize recording: {}", e),
            }
        }
    }
}

// ============================================================================
// MEDIA CONTROLLER
// ============================================================================

pub struct MediaController {
    devices: Arc<dyn CaptureDevices>,
    recordings_dir: PathBuf,
    tracks: Mutex<TrackSet>,
    recording: Mutex<Option<Recording>>,
}

impl MediaController {
    pub fn new(devices: Arc<dyn CaptureDevices>, recordings_dir: PathBuf) -> Self {
        Self {
            devices,
            recordings_dir,
            tracks: Mutex::new(TrackSet::default()),
            recording: Mutex::new(None),
        }
    }

    /// Fordert Mikrofon und bei Videoanrufen die Kamera an
    ///
    /// Wartet auf die Freigabe durch Benutzer bzw. Betriebssystem. Wird
    /// währenddessen [`release_all`](Self::release_all) aufgerufen, werden
    /// die neuen Tracks sofort wieder gestoppt und `Cancelled` gemeldet.
    pub async fn acquire_tracks(&self, call_type: CallType) -> Result<LocalTracks, MediaError> {
        let epoch = {
            let mut set = self.tracks.lock();
            if set.acquiring || set.audio.is_some() || set.video.is_some() {
                return Err(MediaError::DevicesBusy);
            }
            set.acquiring = true;
            set.epoch
        };

        let result = self.open_tracks(call_type).await;

        let mut set = self.tracks.lock();
        if set.epoch != epoch {
            drop(set);
            if let Ok(tracks) = result {
                tracing::info!("Media acquisition finished after release, stopping tracks");
                stop_all(&tracks);
            }
            return Err(MediaError::Cancelled);
        }

        set.acquiring = false;
        let tracks = result?;
        set.audio = tracks.audio.clone();
        set.video = tracks.video.clone();

        tracing::info!(
            "Acquired local tracks for {} call (camera: {})",
            call_type,
            tracks.video.is_some()
        );
        Ok(tracks)
    }

    async fn open_tracks(&self, call_type: CallType) -> Result<LocalTracks, MediaError> {
        let audio = MediaTrack::local(TrackSource::Microphone);
        let handle = self
            .devices
            .open_microphone(audio.feed())
            .await
            .map_err(MediaError::MediaPermissionDenied)?;
        audio.attach_capture(handle);

        let video = if call_type.wants_video() {
            let camera = MediaTrack::local(TrackSource::Camera);
            match self.devices.open_camera(camera.feed()).await {
                Ok(handle) => {
                    camera.attach_capture(handle);
                    Some(camera)
                }
                Err(e) => {
                    audio.stop();
                    return Err(MediaError::MediaPermissionDenied(e));
                }
            }
        } else {
            None
        };

        Ok(LocalTracks {
            audio: Some(audio),
            video,
        })
    }

    /// Aktuell aktive lokale Tracks
    pub fn local_tracks(&self) -> LocalTracks {
        let set = self.tracks.lock();
        LocalTracks {
            audio: set.audio.clone(),
            video: set.video.clone(),
        }
    }

    /// Mikrofon an/aus; `None` wenn kein Mikrofon-Track existiert
    pub fn toggle_mic(&self) -> Option<bool> {
        self.tracks.lock().audio.as_ref().map(|t| t.toggle())
    }

    /// Kamera an/aus; `None` wenn kein Kamera-Track existiert
    pub fn toggle_camera(&self) -> Option<bool> {
        self.tracks.lock().camera().map(|t| t.toggle())
    }

    /// Startet bzw. beendet das Teilen des Bildschirms
    ///
    /// Der Bildschirm-Track ersetzt die Kamera auf dem bestehenden
    /// Video-Kanal der Session. Ein zweiter Aufruf stellt die Kamera wieder
    /// her und stoppt den Bildschirm-Track. Gibt zurück, ob nun geteilt wird.
    pub async fn share_screen(&self, session: &dyn MediaSession) -> Result<bool, MediaError> {
        let (epoch, restore) = {
            let set = self.tracks.lock();
            if set.video.is_none() {
                return Err(MediaError::Session(SessionError::NoVideoChannel));
            }
            let restore = if set.is_sharing() {
                set.saved_camera.clone()
            } else {
                None
            };
            (set.epoch, restore)
        };

        match restore {
            Some(camera) => {
                session.replace_video_track(Arc::clone(&camera)).await?;

                let screen = {
                    let mut set = self.tracks.lock();
                    if set.epoch != epoch {
                        return Err(MediaError::Cancelled);
                    }
                    set.saved_camera = None;
                    set.video.replace(camera)
                };
                if let Some(screen) = screen {
                    screen.stop();
                }
                tracing::info!("Screen sharing stopped, camera restored");
                Ok(false)
            }
            None => {
                let screen = MediaTrack::local(TrackSource::Screen);
                let handle = self
                    .devices
                    .open_screen(screen.feed())
                    .await
                    .map_err(MediaError::MediaPermissionDenied)?;
                screen.attach_capture(handle);

                if let Err(e) = session.replace_video_track(Arc::clone(&screen)).await {
                    screen.stop();
                    return Err(e.into());
                }

                let mut set = self.tracks.lock();
                if set.epoch != epoch {
                    drop(set);
                    screen.stop();
                    return Err(MediaError::Cancelled);
                }
                set.saved_camera = set.video.replace(screen);
                tracing::info!("Screen sharing started");
                Ok(true)
            }
        }
    }

    /// Startet eine Aufnahme aus den Remote-Tracks und dem lokalen Audio
    ///
    /// Aufgenommen wird eine Kopie des Mikrofons, Stummschalten während der
    /// Aufnahme betrifft nur den gesendeten Track.
    pub async fn start_recording(&self, remote: Vec<Arc<MediaTrack>>) -> Result<(), MediaError> {
        if remote.is_empty() {
            return Err(MediaError::NoActiveMediaStream);
        }
        if self.recording.lock().is_some() {
            return Err(MediaError::AlreadyRecording);
        }

        let (epoch, audio_copy) = {
            let set = self.tracks.lock();
            (set.epoch, set.audio.as_ref().map(|audio| audio.copy()))
        };

        let mut sources = remote;
        sources.extend(audio_copy.clone());

        let active = match ActiveRecording::start(&self.recordings_dir, sources).await {
            Ok(active) => active,
            Err(e) => {
                if let Some(copy) = &audio_copy {
                    copy.stop();
                }
                return Err(e.into());
            }
        };
        let recording = Recording { active, audio_copy };

        let rejected = {
            let set = self.tracks.lock();
            let mut slot = self.recording.lock();
            if set.epoch != epoch {
                Some((recording, MediaError::Cancelled))
            } else if slot.is_some() {
                Some((recording, MediaError::AlreadyRecording))
            } else {
                *slot = Some(recording);
                None
            }
        };
        if let Some((recording, error)) = rejected {
            let _ = recording.finish().await;
            return Err(error);
        }
        Ok(())
    }

    /// Beendet die Aufnahme und gibt den Pfad der Datei zurück
    pub async fn stop_recording(&self) -> Result<PathBuf, MediaError> {
        let recording = self
            .recording
            .lock()
            .take()
            .ok_or(MediaError::NotRecording)?;
        Ok(recording.finish().await?)
    }

    /// Stoppt alle lokalen Tracks und schließt eine laufende Aufnahme ab
    pub async fn release_all(&self) {
        self.detach_all().finish().await;
    }

    /// Gibt alle Geräte sofort frei und löst die Aufnahme vom Controller
    ///
    /// Danach ist der Controller leer; laufende Anforderungen melden
    /// `Cancelled`. Die Aufnahme wird erst mit [`ReleasedMedia::finish`]
    /// abgeschlossen.
    pub fn detach_all(&self) -> ReleasedMedia {
        let (tracks, recording) = {
            let mut set = self.tracks.lock();
            set.epoch += 1;
            set.acquiring = false;
            let tracks: Vec<Arc<MediaTrack>> =
                [set.audio.take(), set.video.take(), set.saved_camera.take()]
                    .into_iter()
                    .flatten()
                    .collect();
            (tracks, self.recording.lock().take())
        };

        ReleasedMedia {
            stopped: tracks.iter().filter(|t| t.stop()).count(),
            recording,
        }
    }

    pub fn is_mic_enabled(&self) -> bool {
        self.tracks.lock().audio.as_ref().is_some_and(|t| t.is_enabled())
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.tracks.lock().camera().is_some_and(|t| t.is_enabled())
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.tracks.lock().is_sharing()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.lock().is_some()
    }

    pub fn has_tracks(&self) -> bool {
        let set = self.tracks.lock();
        set.audio.is_some() || set.video.is_some()
    }
}

fn stop_all(tracks: &LocalTracks) {
    for track in [&tracks.audio, &tracks.video].into_iter().flatten() {
        track.stop();
    }
}

impl std::fmt::Debug for MediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaController")
            .field("mic_enabled", &self.is_mic_enabled())
            .field("camera_enabled", &self.is_camera_enabled())
            .field("sharing_screen", &self.is_sharing_screen())
            .field("recording", &self.is_recording())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{FakeDevices, FakeSession};
    use crate::call_engine::tracks::TrackKind;
    use bytes::Bytes;
    use std::time::Duration;

    fn recorded_files(dir: &std::path::Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn controller(devices: &Arc<FakeDevices>, dir: PathBuf) -> MediaController {
        MediaController::new(Arc::clone(devices) as Arc<dyn CaptureDevices>, dir)
    }

    #[tokio::test]
    async fn test_video_call_acquires_mic_and_camera() {
        let devices = FakeDevices::new();
        let media = controller(&devices, std::env::temp_dir());

        let tracks = media.acquire_tracks(CallType::Video).await.unwrap();
        assert!(tracks.audio.is_some());
        assert!(tracks.video.is_some());
        assert_eq!(devices.opened(), 2);

        media.release_all().await;
        assert_eq!(devices.outstanding(), 0);
        assert!(!media.has_tracks());
    }

    #[tokio::test]
    async fn test_camera_denied_releases_microphone() {
        let devices = FakeDevices::new();
        devices.deny_camera();
        let media = controller(&devices, std::env::temp_dir());

        let result = media.acquire_tracks(CallType::Video).await;
        assert!(matches!(result, Err(MediaError::MediaPermissionDenied(_))));
        assert_eq!(devices.opened(), 1);
        assert_eq!(devices.outstanding(), 0);

        // Nach dem Fehler ist ein neuer Versuch möglich
        devices.allow_all();
        assert!(media.acquire_tracks(CallType::Audio).await.is_ok());
        media.release_all().await;
    }

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let devices = FakeDevices::new();
        let media = controller(&devices, std::env::temp_dir());

        media.acquire_tracks(CallType::Audio).await.unwrap();
        assert!(matches!(
            media.acquire_tracks(CallType::Audio).await,
            Err(MediaError::DevicesBusy)
        ));
        assert_eq!(devices.opened(), 1);
        media.release_all().await;
    }

    #[tokio::test]
    async fn test_release_during_acquire_cancels() {
        let devices = FakeDevices::new();
        devices.hold_approval();
        let media = Arc::new(controller(&devices, std::env::temp_dir()));

        let pending = {
            let media = Arc::clone(&media);
            tokio::spawn(async move { media.acquire_tracks(CallType::Video).await })
        };
        while devices.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        media.release_all().await;
        devices.grant_approval();

        assert!(matches!(pending.await.unwrap(), Err(MediaError::Cancelled)));
        assert_eq!(devices.outstanding(), 0);
        assert!(!media.has_tracks());
    }

    #[tokio::test]
    async fn test_toggles_are_idempotent_pairs() {
        let devices = FakeDevices::new();
        let media = controller(&devices, std::env::temp_dir());
        assert_eq!(media.toggle_mic(), None);
        assert_eq!(media.toggle_camera(), None);

        media.acquire_tracks(CallType::Video).await.unwrap();
        assert!(media.is_mic_enabled());
        assert_eq!(media.toggle_mic(), Some(false));
        assert_eq!(media.toggle_mic(), Some(true));
        assert_eq!(media.toggle_camera(), Some(false));
        assert!(!media.is_camera_enabled());
        assert_eq!(media.toggle_camera(), Some(true));
        media.release_all().await;
    }

    #[tokio::test]
    async fn test_share_screen_twice_restores_camera() {
        let devices = FakeDevices::new();
        let media = controller(&devices, std::env::temp_dir());
        let (session, _events) = FakeSession::new(true);

        let tracks = media.acquire_tracks(CallType::Video).await.unwrap();
        let camera = tracks.video.unwrap();

        assert!(media.share_screen(session.as_ref()).await.unwrap());
        assert!(media.is_sharing_screen());
        assert_eq!(session.video_source(), Some(TrackSource::Screen));
        assert_eq!(devices.opened(), 3);

        assert!(!media.share_screen(session.as_ref()).await.unwrap());
        assert!(!media.is_sharing_screen());
        assert_eq!(session.video_source(), Some(TrackSource::Camera));
        let active = media.local_tracks().video.unwrap();
        assert_eq!(active.id(), camera.id());
        assert!(!camera.is_stopped());

        // Nur der Bildschirm-Track wurde freigegeben
        assert_eq!(devices.stopped(), 1);

        media.release_all().await;
        assert_eq!(devices.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_share_screen_without_video_channel() {
        let devices = FakeDevices::new();
        let media = controller(&devices, std::env::temp_dir());
        let (session, _events) = FakeSession::new(false);

        media.acquire_tracks(CallType::Audio).await.unwrap();
        assert!(matches!(
            media.share_screen(session.as_ref()).await,
            Err(MediaError::Session(SessionError::NoVideoChannel))
        ));
        assert_eq!(devices.opened(), 1);
        media.release_all().await;
    }

    #[tokio::test]
    async fn test_recording_needs_remote_stream() {
        let devices = FakeDevices::new();
        let dir = tempfile::tempdir().unwrap();
        let media = controller(&devices, dir.path().to_path_buf());

        assert!(matches!(
            media.start_recording(Vec::new()).await,
            Err(MediaError::NoActiveMediaStream)
        ));
        assert!(!media.is_recording());
        assert!(matches!(
            media.stop_recording().await,
            Err(MediaError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_recording_is_finalized_on_release() {
        let devices = FakeDevices::new();
        let dir = tempfile::tempdir().unwrap();
        let media = controller(&devices, dir.path().to_path_buf());
        media.acquire_tracks(CallType::Audio).await.unwrap();

        let remote = MediaTrack::remote("peer-audio", TrackKind::Audio);
        media.start_recording(vec![remote]).await.unwrap();
        assert!(media.is_recording());
        assert!(matches!(
            media.start_recording(vec![MediaTrack::remote("x", TrackKind::Audio)]).await,
            Err(MediaError::AlreadyRecording)
        ));

        media.release_all().await;
        assert!(!media.is_recording());

        let files = recorded_files(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].extension().and_then(|e| e.to_str()),
            Some(crate::call_engine::recorder::RECORDING_EXTENSION)
        );
    }

    #[tokio::test]
    async fn test_recording_keeps_local_audio_while_muted() {
        let devices = FakeDevices::new();
        let dir = tempfile::tempdir().unwrap();
        let media = controller(&devices, dir.path().to_path_buf());
        let tracks = media.acquire_tracks(CallType::Audio).await.unwrap();
        let mic = tracks.audio.unwrap();

        let remote = MediaTrack::remote("peer-audio", TrackKind::Audio);
        media.start_recording(vec![remote]).await.unwrap();

        assert_eq!(media.toggle_mic(), Some(false));
        let mut sent = mic.subscribe();
        assert!(!mic
            .feed()
            .publish(Bytes::from_static(b"spoken-while-muted"), Duration::from_millis(20)));
        assert!(sent.try_recv().is_err());

        let path = media.stop_recording().await.unwrap();
        let content = std::fs::read(&path).unwrap();
        assert!(contains(&content, format!("{}-copy", mic.id()).as_bytes()));
        assert!(contains(&content, b"spoken-while-muted"));

        // Die Kopie hielt kein Gerät, das Mikrofon läuft weiter
        assert!(!mic.is_stopped());
        assert_eq!(devices.stopped(), 0);
        media.release_all().await;
        assert_eq!(devices.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_detach_frees_devices_before_finish() {
        let devices = FakeDevices::new();
        let dir = tempfile::tempdir().unwrap();
        let media = controller(&devices, dir.path().to_path_buf());
        media.acquire_tracks(CallType::Video).await.unwrap();
        media
            .start_recording(vec![MediaTrack::remote("peer-video", TrackKind::Video)])
            .await
            .unwrap();

        let released = media.detach_all();
        assert!(!released.is_empty());
        assert_eq!(devices.outstanding(), 0);
        assert!(!media.has_tracks());
        assert!(!media.is_recording());

        // Ein neuer Anruf kann sofort Geräte anfordern
        media.acquire_tracks(CallType::Audio).await.unwrap();

        released.finish().await;
        assert_eq!(recorded_files(dir.path()).len(), 1);
        assert!(media.has_tracks());
        media.release_all().await;
    }
}
