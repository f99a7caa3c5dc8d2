//! Media-Stream Handles (Local, Remote, Screen)

use super::track::{MediaTrack, TrackKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Local,
    Remote,
    Screen,
}

/// Menge von Tracks einer Quelle
///
/// Klone teilen sich die Track-Liste, ein Track-Tausch ist also für alle
/// Halter sichtbar.
#[derive(Clone)]
pub struct MediaStreamHandle {
    id: String,
    kind: StreamKind,
    tracks: Arc<RwLock<Vec<Arc<MediaTrack>>>>,
}

impl MediaStreamHandle {
    pub fn new(kind: StreamKind, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            tracks: Arc::new(RwLock::new(tracks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// Erster Track der Art
    pub fn track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.tracks.read().iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn audio_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(TrackKind::Video)
    }

    pub fn add_track(&self, track: Arc<MediaTrack>) {
        self.tracks.write().push(track);
    }

    /// Ersetzt den ersten Track gleicher Art und gibt den alten zurück
    pub fn replace_track(&self, track: Arc<MediaTrack>) -> Option<Arc<MediaTrack>> {
        let mut tracks = self.tracks.write();
        match tracks.iter().position(|t| t.kind() == track.kind()) {
            Some(index) => Some(std::mem::replace(&mut tracks[index], track)),
            None => {
                tracks.push(track);
                None
            }
        }
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// `true` wenn es Tracks der Art gibt und alle aktiviert sind
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        let tracks = self.tracks_of(kind);
        !tracks.is_empty() && tracks.iter().all(|t| t.is_enabled())
    }

    pub fn is_live(&self) -> bool {
        self.tracks.read().iter().any(|t| t.is_live())
    }

    /// Stoppt alle Tracks und gibt damit die Geräte frei
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

impl std::fmt::Debug for MediaStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStreamHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tracks", &*self.tracks.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::track::TrackSource;

    fn camera_stream() -> MediaStreamHandle {
        MediaStreamHandle::new(
            StreamKind::Local,
            vec![
                MediaTrack::local(TrackKind::Audio, TrackSource::Microphone, "mic"),
                MediaTrack::local(TrackKind::Video, TrackSource::Camera, "cam"),
            ],
        )
    }

    #[test]
    fn test_replace_track_is_shared_between_clones() {
        let stream = camera_stream();
        let clone = stream.clone();
        let screen = MediaTrack::local(TrackKind::Video, TrackSource::Screen, "screen");

        let old = stream.replace_track(Arc::clone(&screen)).unwrap();
        assert_eq!(old.label(), "cam");
        assert_eq!(clone.video_track().unwrap().id(), screen.id());
    }

    #[test]
    fn test_enabled_flag_per_kind() {
        let stream = camera_stream();
        stream.set_enabled(TrackKind::Video, false);

        assert!(!stream.is_enabled(TrackKind::Video));
        assert!(stream.is_enabled(TrackKind::Audio));
    }

    #[test]
    fn test_stop_all_ends_every_track() {
        let stream = camera_stream();
        stream.stop_all();
        stream.stop_all();
        assert!(!stream.is_live());
    }
}
