//! Schnittstelle zur WebRTC-Engine
//!
//! `PeerTransport` ist die dünne Schicht über einer echten Peer Connection.
//! Der Manager darüber kümmert sich um Verhandlungs-Regeln, Kandidaten-Puffer
//! und den abgeleiteten Verbindungsstatus.

use super::manager::PeerError;
use crate::config::IceConfig;
use crate::media::{MediaTrack, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// DESCRIPTIONS & CANDIDATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

/// SDP Offer oder Answer, wie es über den Signaling-Kanal geht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Aggregierter Zustand der Peer Connection (DTLS + ICE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

/// Was die Engine asynchron meldet
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Gathering(GatheringState),
    Ice(IceConnectionState),
    Link(LinkState),
    RemoteTrack(Arc<MediaTrack>),
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Hängt einen lokalen Track als neuen Sender an
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError>;

    /// Tauscht den Track des Senders dieser Art, ohne neu zu verhandeln
    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>)
        -> Result<(), PeerError>;

    /// Verwirft das ausstehende lokale Offer
    async fn rollback(&self) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt Transports; Events gehen in den übergebenen Kanal
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn test_description_wire_format() {
        let json = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "answer", "sdp": "v=0" }));
    }
}
