//! Session-Zustand und Events

use super::error::ErrorReport;
use crate::media::{MediaStreamHandle, QualityTier};
use crate::signaling::Credentials;
use serde::Serialize;

// ============================================================================
// PHASES
// ============================================================================

/// Lebenszyklus einer Sitzung: `Idle → Initializing → Active → Ending → Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Initializing,
    Active,
    Ending,
    Ended,
}

impl SessionPhase {
    /// `initialize` ist nur aus diesen Phasen erlaubt
    pub fn can_initialize(self) -> bool {
        matches!(self, SessionPhase::Idle | SessionPhase::Ended)
    }
}

/// Verbindungsstatus parallel zur Phase, getrieben von der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal bis `retry()`
    Failed,
}

/// Zuletzt gemeldeter Medienzustand der Gegenseite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl Default for RemoteMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Lesbare Kopie des Session-Zustands für die UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub connection_status: ConnectionStatus,
    pub room_id: Option<String>,
    pub local_user_id: String,
    pub remote_user_id: Option<String>,
    pub reconnect_attempts: u32,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub is_recording: bool,
    pub quality: QualityTier,
    pub remote_media: RemoteMediaState,
    pub last_error: Option<ErrorReport>,
}

/// Veränderlicher Zustand, nur über den Coordinator mutiert
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub phase: SessionPhase,
    pub status: ConnectionStatus,
    pub room_id: Option<String>,
    pub remote_user_id: Option<String>,
    /// Verbindungs-ID der Gegenseite aus dem letzten Offer/Answer
    pub remote_connection_id: Option<String>,
    pub reconnect_attempts: u32,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub recording: bool,
    pub quality: QualityTier,
    pub remote_media: RemoteMediaState,
    pub last_error: Option<ErrorReport>,
    pub credentials: Option<Credentials>,
}

impl SessionState {
    pub fn snapshot(&self, local_user_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            connection_status: self.status,
            room_id: self.room_id.clone(),
            local_user_id: local_user_id.to_string(),
            remote_user_id: self.remote_user_id.clone(),
            reconnect_attempts: self.reconnect_attempts,
            is_audio_enabled: self.audio_enabled,
            is_video_enabled: self.video_enabled,
            is_screen_sharing: self.screen_sharing,
            is_recording: self.recording,
            quality: self.quality,
            remote_media: self.remote_media,
            last_error: self.last_error.clone(),
        }
    }

    /// Alle UI-Schalter aus, Gegenseite vergessen
    pub fn reset_toggles(&mut self) {
        self.audio_enabled = false;
        self.video_enabled = false;
        self.screen_sharing = false;
        self.recording = false;
        self.remote_user_id = None;
        self.remote_connection_id = None;
        self.remote_media = RemoteMediaState::default();
        self.reconnect_attempts = 0;
        self.status = ConnectionStatus::Disconnected;
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom Coordinator ausgelöst werden
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    ConnectionStatusChanged(ConnectionStatus),
    RemoteJoined { user_id: String },
    RemoteLeft { user_id: String },
    /// `None` wenn der Remote-Stream wegfällt
    RemoteStreamChanged(Option<MediaStreamHandle>),
    RemoteMediaChanged(RemoteMediaState),
    LocalMediaChanged { audio_enabled: bool, video_enabled: bool },
    ScreenShareChanged(bool),
    RecordingChanged(bool),
    QualityChanged(QualityTier),
    Error(ErrorReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_toggles() {
        let mut state = SessionState {
            phase: SessionPhase::Ending,
            status: ConnectionStatus::Connected,
            remote_user_id: Some("bob".into()),
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: true,
            recording: true,
            reconnect_attempts: 2,
            ..Default::default()
        };
        state.reset_toggles();

        let snapshot = state.snapshot("alice");
        assert!(!snapshot.is_audio_enabled);
        assert!(!snapshot.is_video_enabled);
        assert!(!snapshot.is_screen_sharing);
        assert!(!snapshot.is_recording);
        assert_eq!(snapshot.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.remote_user_id, None);
        assert_eq!(snapshot.reconnect_attempts, 0);
    }

    #[test]
    fn test_initialize_allowed_phases() {
        assert!(SessionPhase::Idle.can_initialize());
        assert!(SessionPhase::Ended.can_initialize());
        assert!(!SessionPhase::Initializing.can_initialize());
        assert!(!SessionPhase::Active.can_initialize());
        assert!(!SessionPhase::Ending.can_initialize());
    }
}
