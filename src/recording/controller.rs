//! Recording Controller
//!
//! Nimmt den lokalen Stream in festen Zeitscheiben auf. Die Tracks liefern
//! ihre Frames über Sinks; ein Task sammelt sie und schließt pro
//! `timeslice` einen Chunk ab.

use super::artifact::{encode_frame, RecordingArtifact, RecordingSession};
use crate::config::RecordingConfig;
use crate::media::{MediaFrame, MediaStreamHandle, MediaTrack};
use bytes::BytesMut;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("No active local stream to record")]
    NoStream,

    #[error("A recording is already running")]
    AlreadyRecording,

    #[error("No recording is running")]
    NotRecording,

    #[error("The recording contains no data")]
    EmptyRecording,

    #[error("Could not determine the download directory")]
    NoDownloadDirectory,

    #[error("Failed to write recording: {0}")]
    Io(#[from] std::io::Error),
}

struct ActiveRecording {
    session: Arc<Mutex<RecordingSession>>,
    frame_tx: mpsc::UnboundedSender<MediaFrame>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct RecordingController {
    config: RecordingConfig,
    active: Mutex<Option<ActiveRecording>>,
    artifact: Mutex<Option<RecordingArtifact>>,
}

impl RecordingController {
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
            artifact: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Bisher abgeschlossene Chunks der laufenden Aufnahme
    pub fn chunk_count(&self) -> usize {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.session.lock().chunks.len())
            .unwrap_or(0)
    }

    pub fn has_recording(&self) -> bool {
        self.artifact.lock().is_some()
    }

    /// Startet die Aufnahme des lokalen Streams
    pub fn start_recording(&self, stream: Option<&MediaStreamHandle>) -> Result<(), RecordingError> {
        let stream = stream
            .filter(|s| s.is_live())
            .ok_or(RecordingError::NoStream)?;

        let mut active = self.active.lock();
        if active.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }

        let session = Arc::new(Mutex::new(RecordingSession {
            chunks: Vec::new(),
            started_at: Utc::now(),
            mime_type: self.config.mime_type.clone(),
            video_bitrate: self.config.video_bitrate,
            audio_bitrate: self.config.audio_bitrate,
        }));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        for track in stream.tracks() {
            if track.is_live() {
                track.add_sink(frame_tx.clone());
            }
        }

        let task = tokio::spawn(collect_chunks(
            Arc::clone(&session),
            frame_rx,
            stop_rx,
            self.config.timeslice(),
        ));

        tracing::info!(
            "Recording started ({}, {} bit/s video, {} bit/s audio)",
            self.config.mime_type,
            self.config.video_bitrate,
            self.config.audio_bitrate
        );
        *active = Some(ActiveRecording {
            session,
            frame_tx,
            stop_tx,
            task,
        });
        Ok(())
    }

    /// Nimmt einen neu eingesetzten Track (Screen Share, Qualitätswechsel) mit auf
    pub fn attach_track(&self, track: &MediaTrack) {
        if let Some(active) = self.active.lock().as_ref() {
            track.add_sink(active.frame_tx.clone());
        }
    }

    /// Beendet die Aufnahme und setzt das Artefakt zusammen
    ///
    /// `is_recording` ist danach in jedem Fall `false`.
    pub async fn stop_recording(&self) -> Result<(), RecordingError> {
        let active = self
            .active
            .lock()
            .take()
            .ok_or(RecordingError::NotRecording)?;

        // Sinks der Tracks laufen ins Leere sobald der Task endet
        drop(active.frame_tx);
        let _ = active.stop_tx.send(());
        if let Err(e) = active.task.await {
            tracing::warn!("Recording task ended abnormally: {}", e);
        }

        let session = active.session.lock().clone();
        if session.chunks.is_empty() {
            tracing::warn!("Recording stopped without any data");
            return Err(RecordingError::EmptyRecording);
        }

        let artifact = RecordingArtifact::assemble(session);
        tracing::info!(
            "Recording finished: {} chunks, {} bytes",
            artifact.chunk_count,
            artifact.size()
        );
        *self.artifact.lock() = Some(artifact);
        Ok(())
    }

    /// Übergabe an einen Upload; das Artefakt gehört danach dem Aufrufer
    pub fn take_recording(&self) -> Result<RecordingArtifact, RecordingError> {
        self.artifact
            .lock()
            .take()
            .ok_or(RecordingError::EmptyRecording)
    }

    /// Schreibt die Aufnahme als Datei und verwirft sie danach
    pub async fn download_recording(&self, dir: Option<&Path>) -> Result<PathBuf, RecordingError> {
        let artifact = self
            .artifact
            .lock()
            .clone()
            .ok_or(RecordingError::EmptyRecording)?;

        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => default_download_dir()?,
        };
        let path = dir.join(artifact.file_name());
        tokio::fs::write(&path, &artifact.data).await?;

        tracing::info!("Recording saved to {}", path.display());
        self.discard_recording();
        Ok(path)
    }

    pub fn discard_recording(&self) {
        if self.artifact.lock().take().is_some() {
            tracing::debug!("Recording discarded");
        }
    }
}

impl std::fmt::Debug for RecordingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingController")
            .field("is_recording", &self.is_recording())
            .field("has_recording", &self.has_recording())
            .finish()
    }
}

fn default_download_dir() -> Result<PathBuf, RecordingError> {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .ok_or(RecordingError::NoDownloadDirectory)
}

/// Sammelt Frames und schließt pro Zeitscheibe einen Chunk ab
async fn collect_chunks(
    session: Arc<Mutex<RecordingSession>>,
    mut frames: mpsc::UnboundedReceiver<MediaFrame>,
    mut stop: oneshot::Receiver<()>,
    timeslice: std::time::Duration,
) {
    let started = tokio::time::Instant::now();
    let mut buffer = BytesMut::new();
    let mut ticker = tokio::time::interval_at(started + timeslice, timeslice);

    let flush = |buffer: &mut BytesMut| {
        if !buffer.is_empty() {
            session.lock().chunks.push(buffer.split().freeze());
        }
    };

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => flush(&mut buffer),
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let offset = frame.captured_at.saturating_duration_since(started);
                    encode_frame(&mut buffer, &frame, offset);
                }
                None => break,
            },
        }
    }

    // Bereits zugestellte Frames noch mitnehmen
    while let Ok(frame) = frames.try_recv() {
        let offset = frame.captured_at.saturating_duration_since(started);
        encode_frame(&mut buffer, &frame, offset);
    }
    flush(&mut buffer);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{StreamKind, TrackKind, TrackSource};
    use bytes::Bytes;
    use std::time::Duration;

    fn local_stream() -> MediaStreamHandle {
        MediaStreamHandle::new(
            StreamKind::Local,
            vec![
                MediaTrack::local(TrackKind::Audio, TrackSource::Microphone, "mic"),
                MediaTrack::local(TrackKind::Video, TrackSource::Camera, "cam"),
            ],
        )
    }

    async fn feed(stream: &MediaStreamHandle, payload: &'static [u8]) {
        for track in stream.tracks() {
            track
                .write_sample(Bytes::from_static(payload), Duration::from_millis(20))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_start_requires_live_stream() {
        let recorder = RecordingController::new(RecordingConfig::default());
        assert!(matches!(recorder.start_recording(None), Err(RecordingError::NoStream)));

        let stream = local_stream();
        stream.stop_all();
        assert!(matches!(
            recorder.start_recording(Some(&stream)),
            Err(RecordingError::NoStream)
        ));
        assert!(!recorder.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_chunks_is_empty_error() {
        let recorder = RecordingController::new(RecordingConfig::default());
        let stream = local_stream();
        recorder.start_recording(Some(&stream)).unwrap();
        assert!(matches!(
            recorder.start_recording(Some(&stream)),
            Err(RecordingError::AlreadyRecording)
        ));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let err = recorder.stop_recording().await.unwrap_err();

        assert!(matches!(err, RecordingError::EmptyRecording));
        assert!(!recorder.is_recording());
        assert!(!recorder.has_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_per_timeslice() {
        let recorder = RecordingController::new(RecordingConfig::default());
        let stream = local_stream();
        recorder.start_recording(Some(&stream)).unwrap();

        feed(&stream, b"first").await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(recorder.chunk_count(), 1);

        feed(&stream, b"second").await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(recorder.chunk_count(), 2);

        // Rest ohne vollen Tick landet beim Stoppen im letzten Chunk
        feed(&stream, b"third").await;
        recorder.stop_recording().await.unwrap();

        let artifact = recorder.take_recording().unwrap();
        assert_eq!(artifact.chunk_count, 3);
        assert_eq!(artifact.mime_type, "application/octet-stream");
        assert_eq!(artifact.size(), 2 * (13 + 5) + 2 * (13 + 6) + 2 * (13 + 5));
        assert!(recorder.take_recording().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_track_is_recorded() {
        let recorder = RecordingController::new(RecordingConfig::default());
        let stream = local_stream();
        recorder.start_recording(Some(&stream)).unwrap();

        let screen = MediaTrack::local(TrackKind::Video, TrackSource::Screen, "screen");
        recorder.attach_track(&screen);
        screen
            .write_sample(Bytes::from_static(b"pixels"), Duration::from_millis(33))
            .await
            .unwrap();

        recorder.stop_recording().await.unwrap();
        let artifact = recorder.take_recording().unwrap();
        assert_eq!(&artifact.data[13..], b"pixels");
    }

    #[tokio::test]
    async fn test_download_writes_file_and_discards() {
        let recorder = RecordingController::new(RecordingConfig::default());
        let stream = local_stream();
        recorder.start_recording(Some(&stream)).unwrap();
        feed(&stream, b"frame").await;
        recorder.stop_recording().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = recorder.download_recording(Some(dir.path())).await.unwrap();

        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("interview-recording-"));
        assert!(file_name.ends_with(".bin"));
        assert_eq!(std::fs::read(&path).unwrap().len(), 2 * (13 + 5));

        assert!(!recorder.has_recording());
        assert!(matches!(
            recorder.download_recording(Some(dir.path())).await,
            Err(RecordingError::EmptyRecording)
        ));
    }
}
