//! System-Backend für `MediaDevices`
//!
//! Mikrofon über cpal (Cross-Platform Audio I/O), Kamera und Bildschirm über
//! austauschbare `FrameSource`s der einbettenden Anwendung.
//!
//! Das Mikrofon sendet G.711 µ-law (PCMU, 8kHz mono). Das braucht keinen
//! nativen Encoder und gehört zu den Default-Codecs jeder WebRTC-Gegenseite.

use super::constraints::{AudioConstraints, MediaConstraints, VideoConstraints};
use super::devices::{Capability, DeviceError, DeviceErrorKind, MediaDevices};
use super::stream::{MediaStreamHandle, StreamKind};
use super::track::{MediaTrack, TrackKind, TrackSource};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Länge einer Audio-Frame (20ms)
pub const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Ring-Buffer fasst 10 Frames bei 48kHz
const RING_BUFFER_SIZE: usize = 960 * 10;

/// Taktrate von PCMU
const PCMU_SAMPLE_RATE: u32 = 8_000;

// ============================================================================
// FRAME SOURCE
// ============================================================================

/// Liefert Video-Frames (Kamera oder Bildschirm) in einen Track
///
/// Die Quelle schreibt per `MediaTrack::write_sample` bis der Track endet und
/// registriert ihre Freigabe mit `MediaTrack::set_release`. Beendet das System
/// die Aufnahme, ruft sie `MediaTrack::end_externally` auf.
pub trait FrameSource: Send + Sync {
    fn start(
        &self,
        track: Arc<MediaTrack>,
        constraints: Option<VideoConstraints>,
    ) -> Result<(), DeviceError>;
}

// ============================================================================
// CPAL MEDIA DEVICES
// ============================================================================

#[derive(Default)]
pub struct CpalMediaDevices {
    camera: Option<Arc<dyn FrameSource>>,
    screen: Option<Arc<dyn FrameSource>>,
}

impl CpalMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.camera = Some(source);
        self
    }

    pub fn with_screen(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.screen = Some(source);
        self
    }
}

#[async_trait]
impl MediaDevices for CpalMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, DeviceError> {
        let mut tracks = Vec::new();

        if let Some(audio) = constraints.audio {
            tracks.push(start_microphone(audio).await?);
        }

        if let Some(video) = constraints.video {
            let started = match &self.camera {
                Some(source) => {
                    let track = MediaTrack::local(TrackKind::Video, TrackSource::Camera, "camera");
                    source.start(Arc::clone(&track), Some(video)).map(|_| track)
                }
                None => Err(DeviceError::new(
                    DeviceErrorKind::NotFound,
                    Some(Capability::Camera),
                    "no camera source configured",
                )),
            };

            match started {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    // Mikrofon nicht offen lassen
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        Ok(MediaStreamHandle::new(StreamKind::Local, tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStreamHandle, DeviceError> {
        let source = self.screen.as_ref().ok_or_else(|| {
            DeviceError::new(
                DeviceErrorKind::NotFound,
                Some(Capability::Screen),
                "no screen source configured",
            )
        })?;

        let track = MediaTrack::local(TrackKind::Video, TrackSource::Screen, "screen");
        source.start(Arc::clone(&track), None)?;
        Ok(MediaStreamHandle::new(StreamKind::Screen, vec![track]))
    }
}

impl std::fmt::Debug for CpalMediaDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalMediaDevices")
            .field("camera", &self.camera.is_some())
            .field("screen", &self.screen.is_some())
            .finish()
    }
}

// ============================================================================
// MICROPHONE
// ============================================================================

/// Öffnet das Standard-Mikrofon
///
/// cpal-Streams sind nicht Send, daher lebt der Stream auf einem eigenen
/// Thread bis der Track gestoppt wird.
async fn start_microphone(audio: AudioConstraints) -> Result<Arc<MediaTrack>, DeviceError> {
    let track = MediaTrack::local_with_codec(
        TrackKind::Audio,
        TrackSource::Microphone,
        "microphone",
        microphone_codec(),
    );
    let buffer = Arc::new(Mutex::new(HeapRb::<f32>::new(RING_BUFFER_SIZE)));

    let (ready_tx, ready_rx) = oneshot::channel::<Result<(String, u32), DeviceError>>();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let capture_buffer = Arc::clone(&buffer);

    std::thread::Builder::new()
        .name("mic-capture".to_string())
        .spawn(move || match open_input(audio, capture_buffer) {
            Ok((stream, name, rate)) => {
                let _ = ready_tx.send(Ok((name, rate)));
                // Blockiert bis zur Freigabe, dann wird der Stream hier gedroppt
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Microphone capture stopped");
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })
        .map_err(|e| {
            DeviceError::new(DeviceErrorKind::Other, Some(Capability::Microphone), e.to_string())
        })?;

    let (device_name, sample_rate) = ready_rx.await.map_err(|_| {
        DeviceError::new(
            DeviceErrorKind::Other,
            Some(Capability::Microphone),
            "capture thread exited",
        )
    })??;

    tracing::info!(
        "Microphone '{}' capturing at {} Hz (echo cancellation: {}, noise suppression: {}, agc: {})",
        device_name,
        sample_rate,
        audio.echo_cancellation,
        audio.noise_suppression,
        audio.auto_gain_control
    );

    let frame_size = (sample_rate / 50) as usize;
    let pump_track = Arc::clone(&track);
    let pump = tokio::spawn(async move {
        let mut interval = tokio::time::interval(AUDIO_FRAME_DURATION);
        loop {
            tokio::select! {
                _ = pump_track.ended() => break,
                _ = interval.tick() => {
                    let Some(samples) = read_frame(&buffer, frame_size) else {
                        continue;
                    };
                    let payload = pcmu_bytes(&samples, sample_rate);
                    if let Err(e) = pump_track.write_sample(payload, AUDIO_FRAME_DURATION).await {
                        tracing::warn!("Dropping microphone frame: {}", e);
                    }
                }
            }
        }
    });

    track.set_release(move || {
        let _ = stop_tx.send(());
        pump.abort();
    });

    Ok(track)
}

fn open_input(
    audio: AudioConstraints,
    buffer: Arc<Mutex<HeapRb<f32>>>,
) -> Result<(cpal::Stream, String, u32), DeviceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        DeviceError::new(
            DeviceErrorKind::NotFound,
            Some(Capability::Microphone),
            "no audio input device found",
        )
    })?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let configs = device
        .supported_input_configs()
        .map_err(classify_supported_configs)?;
    let config = select_config(configs.collect(), audio.sample_rate)?;
    let channels = config.channels.max(1) as usize;
    let rate = config.sample_rate.0;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut buffer = buffer.lock();
                // Auf Mono heruntermischen
                for frame in data.chunks(channels) {
                    let sample = frame.iter().sum::<f32>() / frame.len() as f32;
                    let _ = buffer.try_push(sample);
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(classify_build)?;

    stream.play().map_err(classify_play)?;
    Ok((stream, name, rate))
}

/// Wählt eine F32-Konfiguration, bevorzugt mit der gewünschten Sample-Rate
fn select_config(
    configs: Vec<SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<StreamConfig, DeviceError> {
    let target = cpal::SampleRate(sample_rate);
    let f32_configs: Vec<_> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if let Some(config) = f32_configs
        .iter()
        .find(|c| c.min_sample_rate() <= target && c.max_sample_rate() >= target)
    {
        return Ok(config.clone().with_sample_rate(target).into());
    }

    f32_configs
        .first()
        .map(|c| c.clone().with_max_sample_rate().into())
        .ok_or_else(|| {
            DeviceError::new(
                DeviceErrorKind::Overconstrained,
                Some(Capability::Microphone),
                "no f32 input configuration available",
            )
        })
}

fn read_frame(buffer: &Mutex<HeapRb<f32>>, frame_size: usize) -> Option<Vec<f32>> {
    let mut buffer = buffer.lock();
    if buffer.occupied_len() < frame_size {
        return None;
    }
    Some((0..frame_size).filter_map(|_| buffer.try_pop()).collect())
}

fn microphone_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Eine Mono-Frame mit `sample_rate` → 8kHz µ-law
///
/// Heruntergerechnet wird per Mittelwert über die jeweils abgedeckten
/// Eingangs-Samples.
fn pcmu_bytes(samples: &[f32], sample_rate: u32) -> Bytes {
    let out_len = samples.len() * PCMU_SAMPLE_RATE as usize / sample_rate.max(1) as usize;
    let mut out = BytesMut::with_capacity(out_len);
    for i in 0..out_len {
        let start = i * samples.len() / out_len;
        let end = ((i + 1) * samples.len() / out_len).max(start + 1);
        let window = &samples[start..end];
        let mean = window.iter().sum::<f32>() / window.len() as f32;
        out.put_u8(linear_to_ulaw(to_i16(mean)));
    }
    out.freeze()
}

/// G.711 µ-law Kompression eines 16-bit Samples
fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

// ============================================================================
// ERROR CLASSIFICATION
// ============================================================================

fn microphone_error(kind: DeviceErrorKind, message: impl Into<String>) -> DeviceError {
    DeviceError::new(kind, Some(Capability::Microphone), message)
}

fn classify_backend(description: &str) -> DeviceErrorKind {
    let lower = description.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        DeviceErrorKind::NotAllowed
    } else if lower.contains("busy") || lower.contains("in use") {
        DeviceErrorKind::NotReadable
    } else {
        DeviceErrorKind::Other
    }
}

fn classify_supported_configs(err: cpal::SupportedStreamConfigsError) -> DeviceError {
    let kind = match &err {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => DeviceErrorKind::NotFound,
        cpal::SupportedStreamConfigsError::InvalidArgument => DeviceErrorKind::Overconstrained,
        cpal::SupportedStreamConfigsError::BackendSpecific { err } => {
            classify_backend(&err.description)
        }
        #[allow(unreachable_patterns)]
        _ => DeviceErrorKind::Other,
    };
    microphone_error(kind, err.to_string())
}

fn classify_build(err: cpal::BuildStreamError) -> DeviceError {
    let kind = match &err {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceErrorKind::NotReadable,
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => DeviceErrorKind::Overconstrained,
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend(&err.description),
        _ => DeviceErrorKind::Other,
    };
    microphone_error(kind, err.to_string())
}

fn classify_play(err: cpal::PlayStreamError) -> DeviceError {
    let kind = match &err {
        cpal::PlayStreamError::DeviceNotAvailable => DeviceErrorKind::NotReadable,
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend(&err.description),
        #[allow(unreachable_patterns)]
        _ => DeviceErrorKind::Other,
    };
    microphone_error(kind, err.to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_messages_are_classified() {
        assert_eq!(
            classify_backend("Permission denied by user"),
            DeviceErrorKind::NotAllowed
        );
        assert_eq!(classify_backend("Device or resource busy"), DeviceErrorKind::NotReadable);
        assert_eq!(classify_backend("ALSA function failed"), DeviceErrorKind::Other);
    }

    #[test]
    fn test_ulaw_reference_values() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(-i16::MAX), 0x00);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
    }

    #[test]
    fn test_microphone_frame_is_pcmu() {
        // 20ms bei 48kHz → 160 Bytes bei 8kHz, übersteuerte Samples geclippt
        let mut samples = vec![0.0f32; 960];
        samples[..6].fill(2.0);
        let bytes = pcmu_bytes(&samples, 48_000);
        assert_eq!(bytes.len(), 160);
        assert_eq!(bytes[0], 0x80);
        assert!(bytes[1..].iter().all(|b| *b == 0xFF));

        assert_eq!(pcmu_bytes(&vec![0.0; 882], 44_100).len(), 160);

        let track = MediaTrack::local_with_codec(
            TrackKind::Audio,
            TrackSource::Microphone,
            "mic",
            microphone_codec(),
        );
        assert_eq!(track.codec_mime_type().as_deref(), Some(MIME_TYPE_PCMU));
    }

    #[test]
    fn test_read_frame_waits_for_full_frame() {
        let buffer = Mutex::new(HeapRb::<f32>::new(16));
        for _ in 0..3 {
            let _ = buffer.lock().try_push(0.5);
        }
        assert!(read_frame(&buffer, 4).is_none());
        let _ = buffer.lock().try_push(0.5);
        assert_eq!(read_frame(&buffer, 4).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_screen_source_is_not_found() {
        let devices = CpalMediaDevices::new();
        let err = devices.get_display_media().await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::NotFound);
        assert_eq!(err.capability, Some(Capability::Screen));
    }
}
