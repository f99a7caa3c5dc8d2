//! Einzelne Media-Tracks (Audio oder Video)
//!
//! Ein lokaler Track kapselt einen `TrackLocalStaticSample`, der an die
//! Peer Connection gehängt wird. Capture-Quellen schreiben Samples über
//! `write_sample`; zusätzliche Sinks (z.B. der Recorder) bekommen jede
//! Frame synchron mit.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("Failed to write sample to track {track_id}: {reason}")]
    Write { track_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Woher die Frames eines Tracks kommen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// Eine erfasste Frame, wie sie an Sinks verteilt wird
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub track_id: String,
    pub kind: TrackKind,
    pub data: Bytes,
    pub duration: Duration,
    pub captured_at: tokio::time::Instant,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Ein Audio- oder Video-Track
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    rtc: Option<Arc<TrackLocalStaticSample>>,
    sinks: Mutex<Vec<mpsc::UnboundedSender<MediaFrame>>>,
    /// Gibt das Gerät frei (Capture-Thread stoppen etc.)
    release: Mutex<Option<ReleaseFn>>,
}

impl MediaTrack {
    /// Erstellt einen lokalen Track mit passendem RTP-Codec
    pub fn local(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Arc<Self> {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        Self::local_with_codec(kind, source, label, codec)
    }

    /// Lokaler Track, dessen Samples bereits im Format von `codec` vorliegen
    pub fn local_with_codec(
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
        codec: RTCRtpCodecCapability,
    ) -> Arc<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let stream_id = match source {
            TrackSource::Screen => "interview-screen",
            _ => "interview-local",
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));

        Arc::new(Self::build(id, kind, source, label.into(), Some(rtc)))
    }

    /// Repräsentiert einen eingehenden Track der Gegenseite
    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        let id = id.into();
        let label = format!("remote-{}", id);
        Arc::new(Self::build(id, kind, TrackSource::Remote, label, None))
    }

    fn build(
        id: String,
        kind: TrackKind,
        source: TrackSource,
        label: String,
        rtc: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            id,
            kind,
            source,
            label,
            enabled: AtomicBool::new(true),
            state,
            rtc,
            sinks: Mutex::new(Vec::new()),
            release: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// MIME-Typ des RTP-Codecs; `None` für Remote-Tracks
    pub fn codec_mime_type(&self) -> Option<String> {
        self.rtc.as_ref().map(|rtc| rtc.codec().mime_type)
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> TrackState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Ändert nur das enabled-Flag, der Track bleibt an der Verbindung
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Der RTP-Track für die Peer Connection (nur lokale Tracks)
    pub fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.rtc.clone()
    }

    /// Registriert die Geräte-Freigabe; läuft sofort wenn der Track schon beendet ist
    pub fn set_release(&self, release: impl FnOnce() + Send + 'static) {
        if self.is_live() {
            *self.release.lock() = Some(Box::new(release));
        } else {
            release();
        }
    }

    /// Hängt einen Sink an, der jede weitere Frame erhält
    pub fn add_sink(&self, sink: mpsc::UnboundedSender<MediaFrame>) {
        self.sinks.lock().push(sink);
    }

    /// Stoppt den Track lokal. Mehrfaches Stoppen ist ein No-op.
    pub fn stop(&self) {
        if self.finish() {
            tracing::debug!("Track {} ({}) stopped", self.id, self.label);
        }
    }

    /// Die Quelle hat den Track beendet (Gerät weg, "Freigabe beenden" im OS-Dialog)
    pub fn end_externally(&self) {
        if self.finish() {
            tracing::info!("Track {} ({}) ended by its source", self.id, self.label);
        }
    }

    fn finish(&self) -> bool {
        if self.state.send_replace(TrackState::Ended) == TrackState::Ended {
            return false;
        }
        self.sinks.lock().clear();
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
        true
    }

    /// Wartet bis der Track beendet ist
    pub async fn ended(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == TrackState::Ended).await;
    }

    /// Schreibt ein Sample; deaktivierte oder beendete Tracks verwerfen es
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TrackError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(());
        }

        let frame = MediaFrame {
            track_id: self.id.clone(),
            kind: self.kind,
            data: data.clone(),
            duration,
            captured_at: tokio::time::Instant::now(),
        };
        self.sinks.lock().retain(|sink| sink.send(frame.clone()).is_ok());

        if let Some(rtc) = &self.rtc {
            rtc.write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| TrackError::Write {
                track_id: self.id.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_stop_is_idempotent_and_releases_once() {
        let track = MediaTrack::local(TrackKind::Audio, TrackSource::Microphone, "mic");
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        track.set_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        track.stop();
        track.end_externally();

        assert_eq!(track.state(), TrackState::Ended);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sink_receives_frames_only_while_enabled() {
        let track = MediaTrack::local(TrackKind::Video, TrackSource::Camera, "cam");
        let (tx, mut rx) = mpsc::unbounded_channel();
        track.add_sink(tx);

        track
            .write_sample(Bytes::from_static(b"one"), Duration::from_millis(33))
            .await
            .unwrap();
        track.set_enabled(false);
        track
            .write_sample(Bytes::from_static(b"two"), Duration::from_millis(33))
            .await
            .unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(&frame.data[..], b"one");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_external_end() {
        let track = MediaTrack::local(TrackKind::Video, TrackSource::Screen, "screen");
        let waiter = Arc::clone(&track);
        let handle = tokio::spawn(async move { waiter.ended().await });

        track.end_externally();
        handle.await.unwrap();
        assert!(!track.is_live());
    }
}
