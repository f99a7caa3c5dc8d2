//! Recording Module - Lokale Aufnahme des eigenen Streams
//!
//! Aufnahme in festen Zeitscheiben, Zusammensetzen zu einem Artefakt und
//! Übergabe an Download oder Upload.

mod artifact;
mod controller;

pub use artifact::{RecordingArtifact, RecordingSession};
pub use controller::{RecordingController, RecordingError};
