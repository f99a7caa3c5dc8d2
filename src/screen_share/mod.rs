//! Screen Share Module - Kamera/Bildschirm-Tausch auf der laufenden Verbindung

mod controller;

pub use controller::{CameraRestore, ScreenShareController, ShareError, ShareEvent};
