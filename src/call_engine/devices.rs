//! Lokale Aufnahmegeräte
//!
//! [`CaptureDevices`] abstrahiert Mikrofon, Kamera und Bildschirmaufnahme.
//! [`SystemDevices`] nimmt das Mikrofon über cpal auf, die Kamera über
//! nokhwa (Feature `camera`) und den Hauptbildschirm über xcap (Feature
//! `screen`). Ohne das jeweilige Feature meldet es `Unsupported`.
//!
//! Jede Quelle läuft auf einem eigenen Thread, weil weder cpal-Streams noch
//! nokhwa-Kameras `Send` sind.

use super::tracks::{CaptureHandle, TrackFeed};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Access to {0} was denied")]
    PermissionDenied(String),

    #[error("No {0} device found")]
    NotFound(&'static str),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build capture stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start capture stream: {0}")]
    StreamPlayError(String),

    #[error("{0} capture is not available in this build")]
    Unsupported(&'static str),
}

// ============================================================================
// CAPTURE DEVICES
// ============================================================================

/// Zugriff auf die Aufnahmegeräte des Benutzers
///
/// Jeder Aufruf kann auf eine Freigabe durch Benutzer oder Betriebssystem
/// warten. Die Quelle schreibt ihre Daten in den übergebenen Feed.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn open_microphone(&self, feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError>;

    async fn open_camera(&self, feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError>;

    async fn open_screen(&self, feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError>;
}

/// Repräsentiert ein Audio-Gerät
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

// ============================================================================
// SYSTEM DEVICES (cpal)
// ============================================================================

/// Geräte des laufenden Systems
pub struct SystemDevices {
    input_level: Arc<Mutex<f32>>,
}

impl SystemDevices {
    pub fn new() -> Self {
        Self {
            input_level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Aktueller Mikrofonpegel (RMS, 0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Gibt alle verfügbaren Audio-Eingabegeräte zurück
    pub fn input_devices() -> Result<Vec<AudioDevice>, DeviceError> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());

        let devices = host
            .input_devices()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| AudioDevice {
                    is_default: Some(&name) == default_input.as_ref(),
                    name,
                })
            })
            .collect();

        Ok(devices)
    }
}

impl Default for SystemDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevices for SystemDevices {
    async fn open_microphone(&self, feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let level = Arc::clone(&self.input_level);
        spawn_capture(
            "mic-capture",
            move || Self::start_capture(feed, level),
            |stream, stop_rx| {
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            },
        )
        .await
    }

    #[cfg(feature = "camera")]
    async fn open_camera(&self, feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        spawn_capture("camera-capture", camera::open, move |camera, stop_rx| {
            camera::run(camera, feed, stop_rx)
        })
        .await
    }

    #[cfg(not(feature = "camera"))]
    async fn open_camera(&self, _feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        Err(DeviceError::Unsupported("camera"))
    }

    #[cfg(feature = "screen")]
    async fn open_screen(&self, feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        spawn_capture("screen-capture", screen::open, move |monitor, stop_rx| {
            screen::run(monitor, feed, stop_rx)
        })
        .await
    }

    #[cfg(not(feature = "screen"))]
    async fn open_screen(&self, _feed: TrackFeed) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        Err(DeviceError::Unsupported("screen"))
    }
}

/// Startet eine Quelle auf einem eigenen Thread
///
/// `open` läuft auf dem Thread; erst wenn es erfolgreich war, kehrt der
/// Aufruf zurück. `run` liefert danach Daten, bis der Stopp-Kanal meldet.
async fn spawn_capture<S, O, R>(
    name: &'static str,
    open: O,
    run: R,
) -> Result<Box<dyn CaptureHandle>, DeviceError>
where
    S: 'static,
    O: FnOnce() -> Result<S, DeviceError> + Send + 'static,
    R: FnOnce(S, Receiver<()>) + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let source = match open() {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            run(source, stop_rx);
        })
        .map_err(|e| DeviceError::StreamBuildError(e.to_string()))?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(Box::new(ThreadCapture {
            name,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err(DeviceError::StreamBuildError(format!(
            "{} thread exited",
            name
        ))),
    }
}

impl SystemDevices {
    /// Startet Audio Capture (Mikrofon) und liefert 20ms-Frames in den Feed
    fn start_capture(feed: TrackFeed, input_level: Arc<Mutex<f32>>) -> Result<Stream, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NotFound("microphone"))?;

        // Beste Konfiguration finden
        let config = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels.max(1) as usize;
        let mut buffer = HeapRb::<f32>::new(RING_BUFFER_SIZE);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Auf Mono heruntermischen
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();
                    if mono.is_empty() {
                        return;
                    }

                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (mono.iter().map(|s| s * s).sum::<f32>() / mono.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    // Auch stumm geschaltet weiterliefern, der Feed verwirft
                    // selbst und versorgt Kopien (Aufnahme) trotzdem

                    // Resampling falls nötig (zu 48kHz)
                    let samples = resample_linear(&mono, source_sample_rate, target_sample_rate);

                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }

                    while buffer.occupied_len() >= FRAME_SIZE {
                        let mut frame = BytesMut::with_capacity(FRAME_SIZE * 4);
                        for _ in 0..FRAME_SIZE {
                            if let Some(sample) = buffer.try_pop() {
                                frame.put_f32_le(sample);
                            }
                        }
                        feed.publish(frame.freeze(), FRAME_DURATION);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    DeviceError::PermissionDenied("microphone".to_string())
                }
                other => DeviceError::StreamBuildError(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| DeviceError::StreamPlayError(e.to_string()))?;

        Ok(stream)
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, DeviceError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: 48kHz > andere, F32 (der Callback erwartet f32-Samples).
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, DeviceError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let mut f32_configs: Vec<SupportedStreamConfigRange> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    // Versuche exakt 48kHz zu finden
    if let Some(pos) = f32_configs
        .iter()
        .position(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
    {
        return Ok(f32_configs.swap_remove(pos).with_sample_rate(target_rate).into());
    }

    // Fallback auf höchste verfügbare Rate
    if let Some(config) = f32_configs.into_iter().next() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(DeviceError::UnsupportedConfig(
        "No f32 audio input configuration found".to_string(),
    ))
}

// ============================================================================
// CAMERA (nokhwa)
// ============================================================================

#[cfg(feature = "camera")]
mod camera {
    use super::super::tracks::TrackFeed;
    use super::DeviceError;
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
    use nokhwa::Camera;
    use std::sync::mpsc::{Receiver, TryRecvError};
    use std::time::Duration;

    /// Öffnet die Standardkamera mit der höchsten Bildrate
    pub(super) fn open() -> Result<Camera, DeviceError> {
        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let mut camera = Camera::new(CameraIndex::Index(0), format).map_err(|e| match e {
            nokhwa::NokhwaError::OpenDeviceError(..) => DeviceError::PermissionDenied("camera".to_string()),
            other => DeviceError::StreamBuildError(other.to_string()),
        })?;
        camera
            .open_stream()
            .map_err(|e| DeviceError::StreamPlayError(e.to_string()))?;

        tracing::info!(
            "Starting camera capture: {} @ {} fps",
            camera.resolution(),
            camera.frame_rate()
        );
        Ok(camera)
    }

    /// Liefert Frames, bis der Stopp-Kanal meldet
    pub(super) fn run(mut camera: Camera, feed: TrackFeed, stop_rx: Receiver<()>) {
        let frame_duration = Duration::from_secs(1) / camera.frame_rate().max(1);

        while let Err(TryRecvError::Empty) = stop_rx.try_recv() {
            match camera.frame() {
                Ok(buffer) => {
                    feed.publish(buffer.buffer_bytes(), frame_duration);
                }
                Err(e) => {
                    tracing::error!("Camera capture error: {}", e);
                    break;
                }
            }
        }

        if let Err(e) = camera.stop_stream() {
            tracing::warn!("Failed to stop camera stream: {}", e);
        }
        tracing::info!("Camera capture stopped");
    }
}

// ============================================================================
// SCREEN (xcap)
// ============================================================================

#[cfg(feature = "screen")]
mod screen {
    use super::super::tracks::TrackFeed;
    use super::DeviceError;
    use bytes::Bytes;
    use std::sync::mpsc::{Receiver, RecvTimeoutError};
    use std::time::Duration;
    use xcap::Monitor;

    /// Bildrate für geteilte Bildschirme
    const SCREEN_FRAME_INTERVAL: Duration = Duration::from_millis(100);

    pub(super) fn open() -> Result<Monitor, DeviceError> {
        let mut monitors = Monitor::all().map_err(|e| DeviceError::StreamBuildError(e.to_string()))?;
        if monitors.is_empty() {
            return Err(DeviceError::NotFound("screen"));
        }
        let index = monitors.iter().position(|m| m.is_primary()).unwrap_or(0);
        let monitor = monitors.swap_remove(index);

        // Erster Abzug prüft die Berechtigung zur Bildschirmaufnahme
        monitor
            .capture_image()
            .map_err(|e| DeviceError::PermissionDenied(format!("screen: {}", e)))?;

        tracing::info!("Starting screen capture of {}", monitor.name());
        Ok(monitor)
    }

    /// Nimmt den Bildschirm in festem Takt auf (RGBA), bis der Stopp-Kanal meldet
    pub(super) fn run(monitor: Monitor, feed: TrackFeed, stop_rx: Receiver<()>) {
        loop {
            match stop_rx.recv_timeout(SCREEN_FRAME_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
            match monitor.capture_image() {
                Ok(image) => {
                    feed.publish(Bytes::from(image.into_raw()), SCREEN_FRAME_INTERVAL);
                }
                Err(e) => {
                    tracing::error!("Screen capture error: {}", e);
                    break;
                }
            }
        }
        tracing::info!("Screen capture stopped");
    }
}

// ============================================================================
// CAPTURE THREAD HANDLE
// ============================================================================

struct ThreadCapture {
    name: &'static str,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for ThreadCapture {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("{} thread panicked", self.name);
            }
        }
    }
}

impl Drop for ThreadCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
