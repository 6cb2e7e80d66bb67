//! Aufnahme eines Anrufs
//!
//! Setzt aus den Remote-Tracks und einer Kopie des lokalen Audio-Tracks
//! einen neuen Stream zusammen und schreibt ihn fortlaufend in eine Datei.
//! Erst beim Stoppen wird die `.part`-Datei unter ihrem endgültigen Namen
//! abgelegt.
//!
//! Dateiformat (little endian):
//! - Header: `PREC`, Version (u8), Anzahl Tracks (u8), pro Track:
//!   Index (u8), Art (u8, 0 = Audio, 1 = Video), ID-Länge (u16), ID
//! - danach Frames: Index (u8), Offset seit Start in µs (u64),
//!   Länge (u32), Payload

use super::tracks::{MediaChunk, MediaTrack, TrackKind};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

pub const RECORDING_MAGIC: &[u8; 4] = b"PREC";
pub const RECORDING_VERSION: u8 = 1;
pub const RECORDING_EXTENSION: &str = "prec";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Nothing to record")]
    NoSources,

    #[error("Too many tracks for one recording: {0}")]
    TooManyTracks(usize),

    #[error("Recording I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording task failed: {0}")]
    Task(String),
}

// ============================================================================
// ACTIVE RECORDING
// ============================================================================

/// Laufende Aufnahme
pub struct ActiveRecording {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<PathBuf, RecorderError>>,
    started_at: chrono::DateTime<Local>,
}

impl ActiveRecording {
    /// Startet die Aufnahme der übergebenen Tracks nach `dir`
    pub async fn start(dir: &Path, sources: Vec<Arc<MediaTrack>>) -> Result<Self, RecorderError> {
        if sources.is_empty() {
            return Err(RecorderError::NoSources);
        }
        if sources.len() > u8::MAX as usize {
            return Err(RecorderError::TooManyTracks(sources.len()));
        }

        tokio::fs::create_dir_all(dir).await?;

        let started_at = Local::now();
        let file_name = format!(
            "call-recording-{}.{}",
            started_at.format("%Y%m%d-%H%M%S"),
            RECORDING_EXTENSION
        );
        let final_path = dir.join(file_name);
        let part_path = final_path.with_extension(format!("{}.part", RECORDING_EXTENSION));

        let mut writer = BufWriter::new(File::create(&part_path).await?);
        write_header(&mut writer, &sources).await?;

        // Abonnieren, bevor der Task startet, damit kein Chunk verloren geht
        let receivers: Vec<broadcast::Receiver<MediaChunk>> =
            sources.iter().map(|t| t.subscribe()).collect();

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(record_loop(writer, receivers, stop_rx, part_path, final_path));

        tracing::info!("Recording started with {} track(s)", sources.len());

        Ok(Self {
            stop_tx,
            task,
            started_at,
        })
    }

    pub fn started_at(&self) -> chrono::DateTime<Local> {
        self.started_at
    }

    /// Beendet die Aufnahme und gibt den Pfad der fertigen Datei zurück
    pub async fn stop(self) -> Result<PathBuf, RecorderError> {
        let _ = self.stop_tx.send(());
        self.task
            .await
            .map_err(|e| RecorderError::Task(e.to_string()))?
    }
}

async fn write_header(
    writer: &mut BufWriter<File>,
    sources: &[Arc<MediaTrack>],
) -> Result<(), RecorderError> {
    writer.write_all(RECORDING_MAGIC).await?;
    writer.write_u8(RECORDING_VERSION).await?;
    writer.write_u8(sources.len() as u8).await?;

    for (index, track) in sources.iter().enumerate() {
        let id = track.id().as_bytes();
        let id_len = u16::try_from(id.len()).unwrap_or(u16::MAX);
        writer.write_u8(index as u8).await?;
        writer.write_u8(kind_byte(track.kind())).await?;
        writer.write_u16_le(id_len).await?;
        writer.write_all(&id[..id_len as usize]).await?;
    }
    Ok(())
}

fn kind_byte(kind: TrackKind) -> u8 {
    match kind {
        TrackKind::Audio => 0,
        TrackKind::Video => 1,
    }
}

async fn write_frame(
    writer: &mut BufWriter<File>,
    index: u8,
    started: Instant,
    chunk: &MediaChunk,
) -> Result<(), RecorderError> {
    let len = u32::try_from(chunk.payload.len()).unwrap_or(u32::MAX);
    writer.write_u8(index).await?;
    writer
        .write_u64_le(started.elapsed().as_micros() as u64)
        .await?;
    writer.write_u32_le(len).await?;
    writer.write_all(&chunk.payload[..len as usize]).await?;
    Ok(())
}

async fn record_loop(
    mut writer: BufWriter<File>,
    mut receivers: Vec<broadcast::Receiver<MediaChunk>>,
    mut stop_rx: oneshot::Receiver<()>,
    part_path: PathBuf,
    final_path: PathBuf,
) -> Result<PathBuf, RecorderError> {
    let started = Instant::now();
    let mut indices: Vec<u8> = (0..receivers.len() as u8).collect();
    let mut frames: u64 = 0;

    loop {
        if receivers.is_empty() {
            let _ = (&mut stop_rx).await;
            break;
        }

        let next = {
            let pending = futures::future::select_all(
                receivers.iter_mut().map(|rx| Box::pin(rx.recv())),
            );
            tokio::select! {
                _ = &mut stop_rx => None,
                (result, pos, _) = pending => Some((pos, result)),
            }
        };

        let Some((pos, result)) = next else {
            break;
        };

        match result {
            Ok(chunk) => {
                write_frame(&mut writer, indices[pos], started, &chunk).await?;
                frames += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Recording fell behind, {} chunk(s) skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                receivers.remove(pos);
                indices.remove(pos);
            }
        }
    }

    // Was bis zum Stopp veröffentlicht wurde, noch mitnehmen
    for (rx, index) in receivers.iter_mut().zip(indices.iter()) {
        loop {
            match rx.try_recv() {
                Ok(chunk) => {
                    write_frame(&mut writer, *index, started, &chunk).await?;
                    frames += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    tokio::fs::rename(&part_path, &final_path).await?;

    tracing::info!("Recording finalized: {:?} ({} frames)", final_path, frames);
    Ok(final_path)
}
