//! Fehlerklassen des Coordinators
//!
//! Jeder Fehler einer Komponente landet als `CallError` beim Coordinator und
//! wird genau einmal als `ErrorReport` gemeldet.

use super::state::SessionPhase;
use crate::config::ConfigError;
use crate::media::PermissionError;
use crate::peer::PeerError;
use crate::recording::RecordingError;
use crate::screen_share::ShareError;
use crate::signaling::SignalingError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Share(#[from] ShareError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Session is already {0:?}")]
    AlreadyActive(SessionPhase),

    #[error("No active session")]
    NoSession,

    #[error("Signaling relay unreachable after all reconnect attempts")]
    SignalingLost,

    #[error("Call failed after {attempts} recovery attempts")]
    CallFailed { attempts: u32 },
}

/// Fehlerklassen für die UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Permission,
    Negotiation,
    Transport,
    Media,
    Resource,
    Session,
}

fn peer_category(err: &PeerError) -> ErrorCategory {
    match err {
        PeerError::NegotiationInProgress
        | PeerError::OfferAlreadyAnswered
        | PeerError::InvalidState(_)
        | PeerError::Closed => ErrorCategory::Negotiation,
        PeerError::NoSender(_) | PeerError::Engine(_) => ErrorCategory::Media,
    }
}

impl CallError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CallError::Signaling(SignalingError::Authentication) => ErrorCategory::Session,
            CallError::Signaling(SignalingError::Transport(_)) | CallError::SignalingLost => {
                ErrorCategory::Transport
            }
            CallError::Peer(e) => peer_category(e),
            CallError::Permission(_) | CallError::Share(ShareError::Permission(_)) => {
                ErrorCategory::Permission
            }
            CallError::Share(ShareError::Peer(e)) => peer_category(e),
            CallError::Share(_) | CallError::CallFailed { .. } => ErrorCategory::Media,
            CallError::Recording(_) => ErrorCategory::Resource,
            CallError::Config(_) | CallError::AlreadyActive(_) | CallError::NoSession => {
                ErrorCategory::Session
            }
        }
    }

    /// Text für den Benutzer, mit Handlungsanweisung wo es eine gibt
    pub fn user_message(&self) -> String {
        match self {
            CallError::Permission(e) | CallError::Share(ShareError::Permission(e)) => {
                e.user_message()
            }
            CallError::Signaling(SignalingError::Authentication) => {
                "You are not signed in. Sign in again and rejoin the interview.".to_string()
            }
            CallError::Signaling(SignalingError::Transport(_)) | CallError::SignalingLost => {
                "Connection to the interview server was lost. Check your network and retry."
                    .to_string()
            }
            CallError::CallFailed { .. } => {
                "The call could not be reconnected. Press retry to connect again.".to_string()
            }
            CallError::Recording(RecordingError::EmptyRecording) => {
                "The recording is empty. Record for a little longer and try again.".to_string()
            }
            other => format!("Something went wrong: {other}"),
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            message: self.to_string(),
            user_message: self.user_message(),
            occurred_at: Utc::now(),
        }
    }
}

/// Einmal gemeldeter, klassifizierter Fehler
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub message: String,
    pub user_message: String,
    pub occurred_at: DateTime<Utc>,
}

pub type ErrorCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;
