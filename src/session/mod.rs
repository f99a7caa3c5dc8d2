//! Session Module - Lebenszyklus einer Interview-Sitzung
//!
//! Der `SessionCoordinator` besitzt Signaling-Client, Peer Connection und
//! alle Medien-Handles einer Sitzung exklusiv.

mod coordinator;
mod error;
mod state;

pub use coordinator::SessionCoordinator;
pub use error::{CallError, ErrorCallback, ErrorCategory, ErrorReport};
pub use state::{
    ConnectionStatus, RemoteMediaState, SessionEvent, SessionPhase, SessionSnapshot,
};
