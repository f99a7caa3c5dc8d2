//! Media Module - Geräte, Berechtigungen und Tracks
//!
//! Dieses Modul verwaltet:
//! - Qualitätsstufen und Constraints
//! - Lokale, entfernte und Bildschirm-Streams
//! - Berechtigungs-Checks und Geräte-Zugriff
//! - Das cpal-basierte System-Backend

mod constraints;
mod devices;
mod permissions;
mod stream;
mod system;
mod track;

pub use constraints::{AudioConstraints, MediaConstraints, QualityTier, VideoConstraints};
pub use devices::{Capability, DeviceError, DeviceErrorKind, MediaDevices};
pub use permissions::{
    MediaManager, PermissionError, PermissionFailure, PermissionState, PermissionStatus,
};
pub use stream::{MediaStreamHandle, StreamKind};
pub use system::{CpalMediaDevices, FrameSource, AUDIO_FRAME_DURATION};
pub use track::{MediaFrame, MediaTrack, TrackError, TrackKind, TrackSource, TrackState};
