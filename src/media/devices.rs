//! Schnittstelle zu den Capture-Geräten
//!
//! `MediaDevices` ist die Naht zwischen Permission-Manager und der Plattform.
//! Backends melden Fehler als `DeviceError` mit dem rohen Fehlersignal,
//! die Klassifizierung passiert im Permission-Manager.

use super::constraints::MediaConstraints;
use super::stream::MediaStreamHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Berechtigungs-Kategorie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Camera,
    Microphone,
    Screen,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Camera => "camera",
            Capability::Microphone => "microphone",
            Capability::Screen => "screen capture",
        };
        f.write_str(name)
    }
}

/// Rohes Fehlersignal eines Backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Zugriff vom Benutzer oder System verweigert
    NotAllowed,
    /// Kein passendes Gerät vorhanden
    NotFound,
    /// Gerät vorhanden aber nicht lesbar (belegt, Treiberfehler)
    NotReadable,
    /// Constraints können nicht erfüllt werden
    Overconstrained,
    Other,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?} ({capability:?}): {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    /// Betroffenes Gerät, falls bekannt
    pub capability: Option<Capability>,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, capability: Option<Capability>, message: impl Into<String>) -> Self {
        Self {
            kind,
            capability,
            message: message.into(),
        }
    }
}

/// Zugriff auf Kamera, Mikrofon und Bildschirm
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Kamera und/oder Mikrofon gemäß Constraints öffnen
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, DeviceError>;

    /// Bildschirmaufnahme öffnen
    async fn get_display_media(&self) -> Result<MediaStreamHandle, DeviceError>;
}
