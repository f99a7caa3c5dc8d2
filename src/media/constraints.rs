//! Qualitätsstufen und Media-Constraints

use serde::{Deserialize, Serialize};

/// Benannte Qualitätsstufe für lokale Kamera/Mikrofon-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    #[serde(alias = "HIGH_QUALITY")]
    High,
    #[default]
    #[serde(alias = "MEDIUM_QUALITY")]
    Medium,
    #[serde(alias = "LOW_QUALITY")]
    Low,
}

impl QualityTier {
    pub fn constraints(self) -> MediaConstraints {
        let video = match self {
            QualityTier::High => VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            },
            QualityTier::Medium => VideoConstraints {
                width: 640,
                height: 480,
                frame_rate: 24,
            },
            QualityTier::Low => VideoConstraints {
                width: 320,
                height: 240,
                frame_rate: 15,
            },
        };

        MediaConstraints {
            audio: Some(AudioConstraints::default()),
            video: Some(video),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48_000,
        }
    }
}

/// Was von den Geräten angefordert wird; `None` heißt "nicht anfordern"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Minimaler Request für den Berechtigungs-Check
    pub fn probe() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: QualityTier::Low.constraints().video,
        }
    }
}
