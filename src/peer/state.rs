//! Beobachtbarer Verbindungsstatus
//!
//! Die Engine meldet drei getrennte Zustände (Gathering, ICE, Link). Daraus
//! wird genau ein `PeerConnectionState` abgeleitet.

use super::transport::{GatheringState, IceConnectionState, LinkState};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    #[default]
    New,
    Gathering,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Zustände, in denen ein Remote-Stream existieren darf
    pub fn carries_media(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Connecting | PeerConnectionState::Connected
        )
    }
}

/// Letzter gemeldeter Stand der Engine
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStatus {
    pub link: LinkState,
    pub ice: IceConnectionState,
    pub gathering: GatheringState,
}

impl TransportStatus {
    pub fn derive(&self) -> PeerConnectionState {
        use IceConnectionState as Ice;

        if self.link == LinkState::Closed || self.ice == Ice::Closed {
            return PeerConnectionState::Closed;
        }
        if self.link == LinkState::Failed || self.ice == Ice::Failed {
            return PeerConnectionState::Failed;
        }
        if self.link == LinkState::Disconnected || self.ice == Ice::Disconnected {
            return PeerConnectionState::Disconnected;
        }
        // Nach einem ICE-Restart prüft ICE neu, während DTLS noch steht
        if self.ice == Ice::Checking {
            return PeerConnectionState::Connecting;
        }
        if self.link == LinkState::Connected
            || (self.link == LinkState::New && matches!(self.ice, Ice::Connected | Ice::Completed))
        {
            return PeerConnectionState::Connected;
        }
        if self.link == LinkState::Connecting || matches!(self.ice, Ice::Connected | Ice::Completed)
        {
            return PeerConnectionState::Connecting;
        }
        if self.gathering == GatheringState::Gathering {
            return PeerConnectionState::Gathering;
        }
        PeerConnectionState::New
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(
        gathering: GatheringState,
        ice: IceConnectionState,
        link: LinkState,
    ) -> PeerConnectionState {
        TransportStatus {
            link,
            ice,
            gathering,
        }
        .derive()
    }

    #[test]
    fn test_happy_path_progression() {
        use GatheringState as G;
        use IceConnectionState as I;
        use LinkState as L;

        assert_eq!(status(G::New, I::New, L::New), PeerConnectionState::New);
        assert_eq!(status(G::Gathering, I::New, L::New), PeerConnectionState::Gathering);
        assert_eq!(status(G::Gathering, I::Checking, L::Connecting), PeerConnectionState::Connecting);
        assert_eq!(status(G::Complete, I::Connected, L::Connecting), PeerConnectionState::Connecting);
        assert_eq!(status(G::Complete, I::Connected, L::Connected), PeerConnectionState::Connected);
    }

    #[test]
    fn test_failures_take_precedence() {
        use GatheringState as G;
        use IceConnectionState as I;
        use LinkState as L;

        assert_eq!(status(G::Complete, I::Disconnected, L::Connected), PeerConnectionState::Disconnected);
        assert_eq!(status(G::Complete, I::Failed, L::Disconnected), PeerConnectionState::Failed);
        assert_eq!(status(G::Complete, I::Closed, L::Failed), PeerConnectionState::Closed);
    }

    #[test]
    fn test_ice_restart_reports_connecting() {
        let state = status(
            GatheringState::Gathering,
            IceConnectionState::Checking,
            LinkState::Connected,
        );
        assert_eq!(state, PeerConnectionState::Connecting);
        assert!(state.carries_media());
        assert!(!PeerConnectionState::Disconnected.carries_media());
    }
}
