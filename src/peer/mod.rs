//! Peer Module - Verbindungsaufbau zur Gegenseite
//!
//! Dieses Modul verwaltet:
//! - Offer/Answer-Verhandlung und ICE-Restarts
//! - Puffer für früh eintreffende Remote-Candidates
//! - Den abgeleiteten Verbindungsstatus
//! - Das webrtc-rs Backend

mod manager;
mod rtc;
mod state;
mod transport;

pub use manager::{PeerConnectionManager, PeerError, PeerEvent, PeerEventHandler};
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
pub use state::{PeerConnectionState, TransportStatus};
pub use transport::{
    GatheringState, IceCandidate, IceConnectionState, LinkState, PeerTransport,
    PeerTransportFactory, SdpType, SessionDescription, TransportEvent,
};
