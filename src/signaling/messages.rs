//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht ist ein Envelope `{ type, roomId, senderId, payload, timestamp }`.
//! `type` ist eine geschlossene Menge (`MessageKind`), die Payloads sind
//! pro Art typisiert.

use crate::peer::{IceCandidate, SessionDescription};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// MESSAGE KIND
// ============================================================================

/// Alle Nachrichtenarten des Wire-Protokolls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
    MediaStateChange,
    ScreenShareStart,
    ScreenShareStop,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Join,
        MessageKind::Leave,
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::IceCandidate,
        MessageKind::MediaStateChange,
        MessageKind::ScreenShareStart,
        MessageKind::ScreenShareStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::MediaStateChange => "media-state-change",
            MessageKind::ScreenShareStart => "screen-share-start",
            MessageKind::ScreenShareStop => "screen-share-stop",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Unveränderliche Signaling-Nachricht
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Unix-Zeit in Millisekunden
    pub timestamp: i64,
}

impl SignalingMessage {
    pub fn new(
        kind: MessageKind,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Payload in den erwarteten Typ umwandeln
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Payload von `join`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Payload von `leave`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub user_id: String,
}

/// Payload von `offer` und `answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    pub description: SessionDescription,
    /// Verbindung des Absenders; eine neue ID bedeutet kompletten Neuaufbau
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// Payload von `ice-candidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

/// Payload von `media-state-change`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatePayload {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// Payload von `screen-share-start` und `screen-share-stop`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenSharePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let msg = SignalingMessage::new(
            MessageKind::IceCandidate,
            "room-1",
            "alice",
            serde_json::json!({ "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host" } }),
        );

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["roomId"], "room-1");
        assert_eq!(json["senderId"], "alice");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_typed_payload() {
        let raw = r#"{
            "type": "media-state-change",
            "roomId": "room-1",
            "senderId": "bob",
            "payload": { "audioEnabled": false, "videoEnabled": true },
            "timestamp": 1700000000000
        }"#;

        let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, MessageKind::MediaStateChange);

        let state: MediaStatePayload = msg.payload_as().unwrap();
        assert!(!state.audio_enabled);
        assert!(state.video_enabled);
    }

    #[test]
    fn test_description_payload_without_connection_id() {
        let raw = r#"{ "description": { "type": "offer", "sdp": "v=0" } }"#;
        let payload: DescriptionPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.description, SessionDescription::offer("v=0"));
        assert!(payload.connection_id.is_none());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = r#"{ "type": "chat", "roomId": "r", "senderId": "s", "timestamp": 1 }"#;
        assert!(serde_json::from_str::<SignalingMessage>(raw).is_err());
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in MessageKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
