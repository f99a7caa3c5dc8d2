//! Permission & Media Acquisition Manager
//!
//! Prüft und fordert Kamera/Mikrofon/Bildschirm-Zugriff an und liefert
//! lokale Streams in einer wählbaren Qualitätsstufe. Jeder gelieferte
//! Stream gehört exklusiv dem Aufrufer und muss von ihm gestoppt werden.

use super::constraints::{MediaConstraints, QualityTier};
use super::devices::{Capability, DeviceError, DeviceErrorKind, MediaDevices};
use super::stream::MediaStreamHandle;
use super::track::{MediaTrack, TrackKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// PERMISSION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    #[default]
    Unknown,
    Granted,
    Denied,
}

/// Berechtigungen pro Kategorie; wird nur vom Manager verändert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionState {
    pub camera: PermissionStatus,
    pub microphone: PermissionStatus,
    pub screen: PermissionStatus,
}

impl PermissionState {
    pub fn get(&self, capability: Capability) -> PermissionStatus {
        match capability {
            Capability::Camera => self.camera,
            Capability::Microphone => self.microphone,
            Capability::Screen => self.screen,
        }
    }

    fn set(&mut self, capability: Capability, status: PermissionStatus) {
        match capability {
            Capability::Camera => self.camera = status,
            Capability::Microphone => self.microphone = status,
            Capability::Screen => self.screen = status,
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Klassifizierter Grund eines fehlgeschlagenen Zugriffs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionFailure {
    Denied,
    DeviceNotFound,
    DeviceBusy,
    ConstraintsUnsatisfiable,
    Unknown,
}

impl PermissionFailure {
    fn classify(kind: DeviceErrorKind) -> Self {
        match kind {
            DeviceErrorKind::NotAllowed => Self::Denied,
            DeviceErrorKind::NotFound => Self::DeviceNotFound,
            DeviceErrorKind::NotReadable => Self::DeviceBusy,
            DeviceErrorKind::Overconstrained => Self::ConstraintsUnsatisfiable,
            DeviceErrorKind::Other => Self::Unknown,
        }
    }

    /// Handlungsanweisung für den Benutzer
    pub fn user_message(&self, capability: Capability) -> String {
        match self {
            Self::Denied => format!(
                "Access to the {capability} was denied. Allow {capability} access in your system settings and retry."
            ),
            Self::DeviceNotFound => {
                format!("No {capability} was found. Connect a {capability} and retry.")
            }
            Self::DeviceBusy => format!(
                "The {capability} is in use by another application. Close that application and retry."
            ),
            Self::ConstraintsUnsatisfiable => format!(
                "The {capability} does not support the requested quality. Choose a lower quality and retry."
            ),
            Self::Unknown => format!("Could not access the {capability}. Please retry."),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{capability} access failed ({failure:?}): {detail}")]
pub struct PermissionError {
    pub capability: Capability,
    pub failure: PermissionFailure,
    pub detail: String,
}

impl PermissionError {
    fn from_device(err: DeviceError, fallback: Capability) -> Self {
        Self {
            capability: err.capability.unwrap_or(fallback),
            failure: PermissionFailure::classify(err.kind),
            detail: err.message,
        }
    }

    pub fn user_message(&self) -> String {
        self.failure.user_message(self.capability)
    }
}

// ============================================================================
// MEDIA MANAGER
// ============================================================================

pub struct MediaManager {
    devices: Arc<dyn MediaDevices>,
    permissions: RwLock<PermissionState>,
    last_failure: RwLock<Option<PermissionError>>,
    current_tier: RwLock<QualityTier>,
}

impl MediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>, default_tier: QualityTier) -> Self {
        Self {
            devices,
            permissions: RwLock::new(PermissionState::default()),
            last_failure: RwLock::new(None),
            current_tier: RwLock::new(default_tier),
        }
    }

    pub fn permission_state(&self) -> PermissionState {
        *self.permissions.read()
    }

    pub fn last_failure(&self) -> Option<PermissionError> {
        self.last_failure.read().clone()
    }

    /// Stufe des zuletzt erfolgreich geöffneten lokalen Streams
    pub fn current_tier(&self) -> QualityTier {
        *self.current_tier.read()
    }

    /// Best-effort Probe: Geräte kurz öffnen und sofort wieder freigeben
    pub async fn check_permissions(&self) -> Result<PermissionState, PermissionError> {
        tracing::debug!("Probing camera/microphone permissions");
        self.probe(MediaConstraints::probe()).await?;
        Ok(self.permission_state())
    }

    /// Explizite Anfrage für Kamera und Mikrofon
    pub async fn request_permissions(&self) -> bool {
        let constraints = self.current_tier().constraints();
        match self.probe(constraints).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Permission request failed: {}", e);
                false
            }
        }
    }

    async fn probe(&self, constraints: MediaConstraints) -> Result<(), PermissionError> {
        match self.devices.get_user_media(&constraints).await {
            Ok(stream) => {
                stream.stop_all();
                self.mark_av_granted();
                Ok(())
            }
            Err(e) => Err(self.record_failure(e, Capability::Camera)),
        }
    }

    /// Lokalen Kamera+Mikrofon Stream in der gewünschten Stufe öffnen
    ///
    /// Ohne erteilte Berechtigung wird zuerst `request_permissions` versucht.
    pub async fn acquire_local_media(
        &self,
        tier: QualityTier,
    ) -> Result<MediaStreamHandle, PermissionError> {
        if !self.has_av_permission() && !self.request_permissions().await {
            return Err(self.last_failure().unwrap_or_else(|| PermissionError {
                capability: Capability::Camera,
                failure: PermissionFailure::Denied,
                detail: "permission request was not granted".to_string(),
            }));
        }

        tracing::info!("Acquiring local media at {:?}", tier);
        let stream = self
            .devices
            .get_user_media(&tier.constraints())
            .await
            .map_err(|e| self.record_failure(e, Capability::Camera))?;

        self.mark_av_granted();
        *self.current_tier.write() = tier;
        Ok(stream)
    }

    /// Nur ein neuer Kamera-Track in der aktuellen Stufe
    pub async fn acquire_camera_video(&self) -> Result<Arc<MediaTrack>, PermissionError> {
        let constraints = MediaConstraints {
            audio: None,
            ..self.current_tier().constraints()
        };
        let stream = self
            .devices
            .get_user_media(&constraints)
            .await
            .map_err(|e| self.record_failure(e, Capability::Camera))?;

        // Nicht angeforderte Tracks sofort freigeben
        let mut video = None;
        for track in stream.tracks() {
            if track.kind() == TrackKind::Video && video.is_none() {
                video = Some(track);
            } else {
                track.stop();
            }
        }

        video.ok_or_else(|| PermissionError {
            capability: Capability::Camera,
            failure: PermissionFailure::DeviceNotFound,
            detail: "capture backend returned no video track".to_string(),
        })
    }

    /// Bildschirmaufnahme öffnen; eigene Berechtigungskategorie
    pub async fn acquire_screen_capture(&self) -> Result<MediaStreamHandle, PermissionError> {
        tracing::info!("Acquiring screen capture");
        match self.devices.get_display_media().await {
            Ok(stream) => {
                self.permissions
                    .write()
                    .set(Capability::Screen, PermissionStatus::Granted);
                Ok(stream)
            }
            Err(e) => Err(self.record_failure(e, Capability::Screen)),
        }
    }

    fn has_av_permission(&self) -> bool {
        let state = self.permission_state();
        state.camera == PermissionStatus::Granted && state.microphone == PermissionStatus::Granted
    }

    fn mark_av_granted(&self) {
        let mut state = self.permissions.write();
        state.set(Capability::Camera, PermissionStatus::Granted);
        state.set(Capability::Microphone, PermissionStatus::Granted);
    }

    fn record_failure(&self, err: DeviceError, fallback: Capability) -> PermissionError {
        let capability_known = err.capability.is_some();
        let error = PermissionError::from_device(err, fallback);
        tracing::warn!("Media acquisition failed: {}", error);

        if error.failure == PermissionFailure::Denied {
            let mut state = self.permissions.write();
            if capability_known || error.capability == Capability::Screen {
                state.set(error.capability, PermissionStatus::Denied);
            } else {
                state.set(Capability::Camera, PermissionStatus::Denied);
                state.set(Capability::Microphone, PermissionStatus::Denied);
            }
        }

        *self.last_failure.write() = Some(error.clone());
        error
    }
}

impl std::fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaManager")
            .field("permissions", &self.permission_state())
            .field("current_tier", &self.current_tier())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevices;

    fn manager(devices: &Arc<FakeDevices>) -> MediaManager {
        MediaManager::new(Arc::clone(devices) as Arc<dyn MediaDevices>, QualityTier::Medium)
    }

    #[tokio::test]
    async fn test_check_permissions_releases_probe_tracks() {
        let devices = FakeDevices::new();
        let manager = manager(&devices);

        let state = manager.check_permissions().await.unwrap();

        assert_eq!(state.camera, PermissionStatus::Granted);
        assert_eq!(state.microphone, PermissionStatus::Granted);
        assert_eq!(state.screen, PermissionStatus::Unknown);
        assert_eq!(devices.live_track_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let cases = [
            (DeviceErrorKind::NotAllowed, PermissionFailure::Denied),
            (DeviceErrorKind::NotFound, PermissionFailure::DeviceNotFound),
            (DeviceErrorKind::NotReadable, PermissionFailure::DeviceBusy),
            (
                DeviceErrorKind::Overconstrained,
                PermissionFailure::ConstraintsUnsatisfiable,
            ),
        ];

        for (kind, expected) in cases {
            let devices = FakeDevices::new();
            devices.fail_user_media(kind);
            let manager = manager(&devices);

            let err = manager.check_permissions().await.unwrap_err();
            assert_eq!(err.failure, expected);
            assert!(!err.user_message().is_empty());
        }
    }

    #[tokio::test]
    async fn test_denied_marks_camera_and_microphone() {
        let devices = FakeDevices::new();
        devices.fail_user_media(DeviceErrorKind::NotAllowed);
        let manager = manager(&devices);

        assert!(!manager.request_permissions().await);
        let state = manager.permission_state();
        assert_eq!(state.camera, PermissionStatus::Denied);
        assert_eq!(state.microphone, PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn test_acquire_requests_permission_first() {
        let devices = FakeDevices::new();
        let manager = manager(&devices);

        let stream = manager.acquire_local_media(QualityTier::High).await.unwrap();

        // Probe + eigentliche Anfrage
        assert_eq!(devices.user_media_calls(), 2);
        assert!(stream.audio_track().is_some());
        assert!(stream.video_track().is_some());
        assert_eq!(manager.current_tier(), QualityTier::High);
        // Nur der zurückgegebene Stream ist noch aktiv
        assert_eq!(devices.live_track_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_refuses_without_permission() {
        let devices = FakeDevices::new();
        devices.fail_user_media(DeviceErrorKind::NotAllowed);
        let manager = manager(&devices);

        let err = manager.acquire_local_media(QualityTier::Low).await.unwrap_err();
        assert_eq!(err.failure, PermissionFailure::Denied);
        assert_eq!(devices.user_media_calls(), 1);
    }

    #[tokio::test]
    async fn test_screen_permission_is_tracked_separately() {
        let devices = FakeDevices::new();
        devices.fail_display(DeviceErrorKind::NotAllowed);
        let manager = manager(&devices);

        let err = manager.acquire_screen_capture().await.unwrap_err();
        assert_eq!(err.capability, Capability::Screen);

        let state = manager.permission_state();
        assert_eq!(state.screen, PermissionStatus::Denied);
        assert_eq!(state.camera, PermissionStatus::Unknown);
    }
}
