//! PeerTransport auf Basis von webrtc-rs
//!
//! Default-Codecs und Interceptors, ICE Server aus der Konfiguration.
//! Alle Callbacks der Peer Connection werden in `TransportEvent`s übersetzt.

use super::manager::PeerError;
use super::transport::{
    GatheringState, IceCandidate, IceConnectionState, LinkState, PeerTransport,
    PeerTransportFactory, SdpType, SessionDescription, TransportEvent,
};
use crate::config::IceConfig;
use crate::media::{MediaTrack, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

fn engine_error(e: impl std::fmt::Display) -> PeerError {
    PeerError::Engine(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt echte WebRTC Peer Connections
#[derive(Debug, Default, Clone)]
pub struct RtcTransportFactory;

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let transport = RtcPeerTransport::new(ice, events).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl RtcPeerTransport {
    pub async fn new(
        ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(engine_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice
                .servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: ice.candidate_pool_size,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(engine_error)?);
        Self::register_handlers(&pc, events);

        Ok(Self {
            pc,
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            let state = match s {
                RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
                RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
                RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                RTCPeerConnectionState::New => Some(LinkState::New),
                _ => None,
            };
            if let Some(state) = state {
                let _ = tx.send(TransportEvent::Link(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            tracing::debug!("ICE connection state: {:?}", s);
            let state = match s {
                RTCIceConnectionState::New => Some(IceConnectionState::New),
                RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                let _ = tx.send(TransportEvent::Ice(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
            let state = match s {
                RTCIceGathererState::New => Some(GatheringState::New),
                RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
                RTCIceGathererState::Complete => Some(GatheringState::Complete),
                _ => None,
            };
            if let Some(state) = state {
                let _ = tx.send(TransportEvent::Gathering(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Eingehende Tracks: RTP-Payloads an die Sinks des Remote-Tracks
        let tx = events;
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let media = MediaTrack::remote(track.id(), kind);
            tracing::info!("Received remote {:?} track: {:?}", kind, track.codec());
            let _ = tx.send(TransportEvent::RemoteTrack(Arc::clone(&media)));

            Box::pin(async move {
                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        if !media.is_live() {
                            return;
                        }
                        let _ = media.write_sample(packet.payload, Duration::ZERO).await;
                    }
                    media.end_externally();
                });
            })
        }));
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp).map_err(engine_error),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp).map_err(engine_error),
            SdpType::Rollback => {
                let mut rollback = RTCSessionDescription::default();
                rollback.sdp_type = RTCSdpType::Rollback;
                Ok(rollback)
            }
        }
    }

    fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
        let sdp_type = match description.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Rollback => SdpType::Rollback,
            other => return Err(PeerError::Engine(format!("Unsupported SDP type {}", other))),
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: description.sdp,
        })
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(engine_error)?;
        Self::from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        Self::from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(engine_error)
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        let rtc = track.rtc_track().ok_or_else(|| {
            PeerError::Engine(format!("Track {} has no outgoing RTP track", track.id()))
        })?;
        let sender = self
            .pc
            .add_track(rtc as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;

        // RTCP lesen, sonst laufen die Interceptors nicht
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(PeerError::NoSender(kind))?;
        let rtc = track.rtc_track().ok_or_else(|| {
            PeerError::Engine(format!("Track {} has no outgoing RTP track", track.id()))
        })?;

        sender
            .replace_track(Some(rtc as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(engine_error)
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.set_local_description(SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        })
        .await
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(engine_error)
    }
}

impl std::fmt::Debug for RtcPeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeerTransport")
            .field("connection_state", &self.pc.connection_state())
            .field("senders", &self.senders.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_contains_outgoing_tracks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ice = IceConfig {
            servers: Vec::new(),
            ..Default::default()
        };
        let transport = RtcPeerTransport::new(&ice, tx).await.unwrap();

        let audio = MediaTrack::local(TrackKind::Audio, crate::media::TrackSource::Microphone, "mic");
        let video = MediaTrack::local(TrackKind::Video, crate::media::TrackSource::Camera, "cam");
        transport.add_track(audio).await.unwrap();
        transport.add_track(Arc::clone(&video)).await.unwrap();

        let offer = transport.create_offer(false).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        let screen = MediaTrack::local(TrackKind::Video, crate::media::TrackSource::Screen, "screen");
        transport.replace_track(TrackKind::Video, screen).await.unwrap();

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_without_sender_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RtcPeerTransport::new(&IceConfig::default(), tx).await.unwrap();
        let screen = MediaTrack::local(TrackKind::Video, crate::media::TrackSource::Screen, "screen");

        let err = transport.replace_track(TrackKind::Video, screen).await.unwrap_err();
        assert!(matches!(err, PeerError::NoSender(TrackKind::Video)));
        transport.close().await.unwrap();
    }
}
