//! Interview Call - P2P Video-Interviews
//!
//! Client-seitige Call-Schicht für Interview-Räume mit:
//! - WebSocket-Relay als Signaling-Kanal (Offer/Answer/ICE)
//! - WebRTC für Audio, Video und Bildschirmfreigabe
//! - Lokaler Aufnahme in zeitgesteuerten Chunks
//! - Automatischer Recovery per ICE-Restart und Backoff
//!
//! Einstiegspunkt ist der `SessionCoordinator`.

pub mod config;
pub mod media;
pub mod peer;
pub mod recording;
pub mod screen_share;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use config::{CallConfig, ConfigError, ReconnectPolicy};
pub use media::{MediaManager, MediaStreamHandle, QualityTier};
pub use peer::{PeerConnectionManager, PeerConnectionState};
pub use recording::{RecordingArtifact, RecordingController};
pub use screen_share::ScreenShareController;
pub use session::{
    CallError, ConnectionStatus, ErrorCategory, ErrorReport, SessionCoordinator, SessionEvent,
    SessionPhase, SessionSnapshot,
};
pub use signaling::{Credentials, SignalingClient};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOGGING: OnceCell<()> = OnceCell::new();

/// Installiert den globalen `tracing` Subscriber
///
/// Filter kommt aus `RUST_LOG`, ergänzt um die Crate-Defaults. Mehrfache
/// Aufrufe sind erlaubt; ist schon ein fremder Subscriber aktiv, bleibt er.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let mut filter = EnvFilter::from_default_env();
        for directive in ["interview_call=debug", "webrtc=warn"] {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Invalid log directive {directive}: {e}"),
            }
        }

        if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
            tracing::info!("Logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        tracing::debug!("still alive");
    }
}
