//! Aufnahme-Sitzung und fertiges Artefakt
//!
//! Das Artefakt ist kein WebM: es ist eine einfache Frame-Folge
//! (`[kind u8][ts_ms u64][len u32][data]`, big endian) mit den Rohdaten der
//! Tracks. Muxen in ein abspielbares Format übernimmt der Empfänger.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::media::{MediaFrame, TrackKind};
use std::time::Duration;

/// Laufende Aufnahme: geordnete Chunks plus feste Parameter
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub chunks: Vec<Bytes>,
    pub started_at: DateTime<Utc>,
    pub mime_type: String,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
}

impl RecordingSession {
    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

/// Fertig zusammengesetzte Aufnahme
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub data: Bytes,
    pub mime_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub chunk_count: usize,
}

impl RecordingArtifact {
    pub(crate) fn assemble(session: RecordingSession) -> Self {
        let mut data = BytesMut::with_capacity(session.total_bytes());
        for chunk in &session.chunks {
            data.extend_from_slice(chunk);
        }

        Self {
            data: data.freeze(),
            mime_type: session.mime_type,
            started_at: session.started_at,
            finished_at: Utc::now(),
            chunk_count: session.chunks.len(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Dateiname für den Download
    pub fn file_name(&self) -> String {
        format!(
            "interview-recording-{}.bin",
            self.started_at.format("%Y%m%d-%H%M%S")
        )
    }

    /// `data:`-URL für den Upload als Formularfeld
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }
}

/// Schreibt eine Frame als `[kind u8][ts_ms u64][len u32][data]` (big endian)
///
/// Frames, deren Länge nicht in das Längenfeld passt, werden verworfen
/// (`false`).
pub(crate) fn encode_frame(buffer: &mut BytesMut, frame: &MediaFrame, offset: Duration) -> bool {
    let len = match u32::try_from(frame.data.len()) {
        Ok(len) => len,
        Err(_) => {
            tracing::warn!(
                "Dropping {} byte frame of track {}, too large for the recording",
                frame.data.len(),
                frame.track_id
            );
            return false;
        }
    };
    let offset_ms = u64::try_from(offset.as_millis()).unwrap_or(u64::MAX);
    let kind = match frame.kind {
        TrackKind::Audio => 0u8,
        TrackKind::Video => 1u8,
    };

    buffer.reserve(13 + frame.data.len());
    buffer.put_u8(kind);
    buffer.put_u64(offset_ms);
    buffer.put_u32(len);
    buffer.extend_from_slice(&frame.data);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(chunks: &[&'static [u8]]) -> RecordingSession {
        RecordingSession {
            chunks: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
            started_at: DateTime::parse_from_rfc3339("2024-03-01T09:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            mime_type: "application/octet-stream".to_string(),
            video_bitrate: 2_500_000,
            audio_bitrate: 128_000,
        }
    }

    #[test]
    fn test_assemble_keeps_chunk_order() {
        let artifact = RecordingArtifact::assemble(session(&[b"ab", b"cd", b"e"]));

        assert_eq!(&artifact.data[..], b"abcde");
        assert_eq!(artifact.chunk_count, 3);
        assert_eq!(artifact.file_name(), "interview-recording-20240301-093000.bin");
    }

    #[test]
    fn test_data_url() {
        let artifact = RecordingArtifact::assemble(session(&[b"hi"]));
        assert_eq!(
            artifact.to_data_url(),
            "data:application/octet-stream;base64,aGk="
        );
    }

    #[test]
    fn test_frame_layout() {
        let frame = MediaFrame {
            track_id: "t".to_string(),
            kind: TrackKind::Video,
            data: Bytes::from_static(b"xyz"),
            duration: Duration::from_millis(33),
            captured_at: tokio::time::Instant::now(),
        };
        let mut buffer = BytesMut::new();
        assert!(encode_frame(&mut buffer, &frame, Duration::from_millis(1500)));

        assert_eq!(buffer.len(), 13 + 3);
        assert_eq!(buffer[0], 1);
        assert_eq!(&buffer[1..9], &1500u64.to_be_bytes());
        assert_eq!(&buffer[9..13], &3u32.to_be_bytes());
        assert_eq!(&buffer[13..], b"xyz");
    }

    #[test]
    fn test_huge_offset_saturates() {
        let frame = MediaFrame {
            track_id: "t".to_string(),
            kind: TrackKind::Audio,
            data: Bytes::from_static(b"a"),
            duration: Duration::from_millis(20),
            captured_at: tokio::time::Instant::now(),
        };
        let mut buffer = BytesMut::new();
        assert!(encode_frame(&mut buffer, &frame, Duration::MAX));

        assert_eq!(buffer[0], 0);
        assert_eq!(&buffer[1..9], &u64::MAX.to_be_bytes());
        assert_eq!(&buffer[9..13], &1u32.to_be_bytes());
    }
}
