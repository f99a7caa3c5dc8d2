//! Konfiguration für Interview-Calls
//!
//! Alle Werte sind statisch konfiguriert und werden nicht zur Laufzeit
//! ausgehandelt:
//! - Signaling-Relay URL (pro Deployment-Umgebung)
//! - STUN/TURN Server und Candidate-Pool
//! - Reconnect-Policy und Timeouts
//! - Recording-Parameter (Mime-Type, Bitraten)
//!
//! Quellen: Defaults, JSON-Datei oder Umgebungsvariablen.

use crate::media::QualityTier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Relay für lokale Entwicklung
pub const DEVELOPMENT_SIGNALING_URL: &str = "ws://localhost:5000";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No signaling URL configured for environment {0:?} (set SIGNALING_URL)")]
    MissingSignalingUrl(Environment),

    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidSignalingUrl { url: String, reason: String },

    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("Could not determine config directory")]
    NoConfigDirectory,
}

// ============================================================================
// ENVIRONMENT
// ============================================================================

/// Deployment-Umgebung, bestimmt die Relay URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Ein STUN/TURN Endpunkt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Geordnete Liste der STUN/TURN Server
    pub servers: Vec<IceServerConfig>,
    pub candidate_pool_size: u8,
    /// Obergrenze für gepufferte Remote-Candidates vor der Remote-Description
    pub max_pending_candidates: usize,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            // Google STUN Server (kostenlos, reicht für die meisten Verbindungen)
            servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            candidate_pool_size: 10,
            max_pending_candidates: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay_ms: u64,
    pub connection_timeout_ms: u64,
    pub ice_gathering_timeout_ms: u64,
    /// Wie lange `disconnected` toleriert wird bevor Recovery startet
    pub disconnect_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            base_reconnect_delay_ms: 1000,
            connection_timeout_ms: 10_000,
            ice_gathering_timeout_ms: 10_000,
            disconnect_grace_ms: 3000,
            heartbeat_interval_ms: 25_000,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.base_reconnect_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub mime_type: String,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    /// Länge eines Chunks
    pub timeslice_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mime_type: "application/octet-stream".to_string(),
            video_bitrate: 2_500_000,
            audio_bitrate: 128_000,
            timeslice_ms: 1000,
        }
    }
}

impl RecordingConfig {
    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Gesamte Konfiguration eines Clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub environment: Environment,
    /// Überschreibt die Relay URL der Umgebung
    pub signaling_url: Option<String>,
    pub ice: IceConfig,
    pub connection: ConnectionConfig,
    pub recording: RecordingConfig,
    pub default_quality: QualityTier,
}

impl CallConfig {
    /// Lädt die Konfiguration aus einer JSON-Datei
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::info!("Loading call config from {:?}", path);
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Defaults plus Umgebungsvariablen (`INTERVIEW_ENV`, `SIGNALING_URL`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Überschreibt Felder mit gesetzten Umgebungsvariablen
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(env) = std::env::var("INTERVIEW_ENV") {
            self.environment = env.parse()?;
        }
        if let Ok(url) = std::env::var("SIGNALING_URL") {
            if !url.trim().is_empty() {
                self.signaling_url = Some(url);
            }
        }
        Ok(())
    }

    /// Standard-Pfad der Konfigurationsdatei
    ///
    /// - Linux: `~/.config/interview-call/config.json`
    /// - macOS: `~/Library/Application Support/com.interview.interview-call/config.json`
    /// - Windows: `%APPDATA%/interview/interview-call/config/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("com", "interview", "interview-call")
            .ok_or(ConfigError::NoConfigDirectory)?;
        Ok(dirs.config_dir().join("config.json"))
    }

    /// Relay URL für die konfigurierte Umgebung
    pub fn signaling_url(&self) -> Result<Url, ConfigError> {
        let raw = match (&self.signaling_url, self.environment) {
            (Some(url), _) => url.clone(),
            (None, Environment::Development) => DEVELOPMENT_SIGNALING_URL.to_string(),
            (None, env) => return Err(ConfigError::MissingSignalingUrl(env)),
        };

        // http(s) wird auf ws(s) umgeschrieben, wie vom Relay erwartet
        let normalized = if let Some(rest) = raw.strip_prefix("http") {
            format!("ws{}", rest)
        } else {
            raw.clone()
        };

        let url = Url::parse(&normalized).map_err(|e| ConfigError::InvalidSignalingUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidSignalingUrl {
                url: raw,
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Exponentielles Backoff: `delay = base * 2^attempt`, begrenzt auf `max_attempts`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Verzögerung für den (0-basierten) Versuch, `None` wenn das Budget erschöpft ist
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ConnectionConfig::default().reconnect_policy()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), 3);

        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), 100);
        assert!(policy.delay_for(40).is_some());
    }

    #[test]
    fn test_development_url_default() {
        let config = CallConfig::default();
        let url = config.signaling_url().unwrap();
        assert_eq!(url.as_str(), "ws://localhost:5000/");
    }

    #[test]
    fn test_production_requires_url() {
        let config = CallConfig {
            environment: Environment::Production,
            ..Default::default()
        };
        assert!(matches!(
            config.signaling_url(),
            Err(ConfigError::MissingSignalingUrl(Environment::Production))
        ));
    }

    #[test]
    fn test_https_url_is_rewritten() {
        let config = CallConfig {
            environment: Environment::Production,
            signaling_url: Some("https://relay.example.org/signal".to_string()),
            ..Default::default()
        };
        let url = config.signaling_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/signal");
    }

    #[test]
    fn test_rejects_non_websocket_scheme() {
        let config = CallConfig {
            signaling_url: Some("ftp://relay".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.signaling_url(),
            Err(ConfigError::InvalidSignalingUrl { .. })
        ));
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "environment": "staging", "connection": { "max_reconnect_attempts": 5 } }"#,
        )
        .unwrap();

        let config = CallConfig::load(&path).unwrap();
        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        // Nicht gesetzte Felder behalten ihre Defaults
        assert_eq!(config.connection.base_reconnect_delay_ms, 1000);
        assert_eq!(config.recording.timeslice_ms, 1000);
        assert_eq!(config.default_quality, QualityTier::Medium);
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert!("qa".parse::<Environment>().is_err());
    }
}
