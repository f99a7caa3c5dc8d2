//! Signaling Module - Kanal zum Relay einer Sitzung
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - Verbindung aufbauen, halten und bei Abbruch neu aufbauen
//! - Typisierte Nachrichten pro Raum senden
//! - Eingehende Nachrichten an registrierte Handler verteilen

mod client;
mod messages;
mod transport;

pub use client::{ChannelEvent, MessageHandler, SignalingClient, SignalingError, SubscriptionId};
pub use messages::*;
pub use transport::{
    Connection, Connector, Credentials, TransportError, TransportFrame, WebSocketConnector,
};
