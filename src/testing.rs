//! In-Memory Fakes für Tests
//!
//! - `MemoryRelay`: Signaling-Relay, das jede Nachricht an alle Verbindungen verteilt
//! - `FakeTransportFactory`: Peer Connections, die sich nach abgeschlossener
//!   Verhandlung selbst verbinden
//! - `FakeDevices`: Capture-Geräte mit skriptbaren Fehlern

use crate::config::IceConfig;
use crate::media::{
    DeviceError, DeviceErrorKind, MediaConstraints, MediaDevices, MediaStreamHandle, MediaTrack,
    StreamKind, TrackKind, TrackSource,
};
use crate::peer::{
    GatheringState, IceCandidate, IceConnectionState, LinkState, PeerError, PeerTransport,
    PeerTransportFactory, SdpType, SessionDescription, TransportEvent,
};
use crate::signaling::{
    Connection, Connector, Credentials, MessageKind, SignalingMessage, TransportError,
    TransportFrame,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

// ============================================================================
// SIGNALING RELAY
// ============================================================================

struct RelayState {
    available: bool,
    next_peer: u64,
    peers: Vec<(u64, mpsc::Sender<TransportFrame>)>,
    attempts: usize,
    log: Vec<SignalingMessage>,
}

pub struct MemoryRelay {
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RelayState {
                available: true,
                next_peer: 0,
                peers: Vec::new(),
                attempts: 0,
                log: Vec::new(),
            }),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            relay: Arc::clone(self),
        })
    }

    /// Weitere Verbindungsversuche scheitern solange `false`
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Trennt alle Verbindungen
    pub fn drop_all(&self, intentional: bool) {
        let peers = std::mem::take(&mut self.state.lock().peers);
        for (_, tx) in peers {
            let _ = tx.try_send(TransportFrame::Closed { intentional });
        }
    }

    /// Alle weitergeleiteten Nachrichten einer Art
    pub fn messages_of(&self, kind: MessageKind) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }
}

struct MemoryConnector {
    relay: Arc<MemoryRelay>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _url: &Url,
        _credentials: &Credentials,
    ) -> Result<Connection, TransportError> {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);
        let (in_tx, in_rx) = mpsc::channel::<TransportFrame>(100);

        let peer_id = {
            let mut state = self.relay.state.lock();
            state.attempts += 1;
            if !state.available {
                return Err(TransportError::Connect("relay unavailable".to_string()));
            }
            let id = state.next_peer;
            state.next_peer += 1;
            state.peers.push((id, in_tx));
            id
        };

        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let targets = {
                    let mut state = relay.state.lock();
                    if !state.peers.iter().any(|(id, _)| *id == peer_id) {
                        break;
                    }
                    if let Ok(message) = serde_json::from_str::<SignalingMessage>(&text) {
                        state.log.push(message);
                    }
                    state
                        .peers
                        .iter()
                        .map(|(_, tx)| tx.clone())
                        .collect::<Vec<_>>()
                };
                for tx in targets {
                    let _ = tx.send(TransportFrame::Text(text.clone())).await;
                }
            }
            relay.state.lock().peers.retain(|(id, _)| *id != peer_id);
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

#[derive(Default)]
struct FakeState {
    offers: u32,
    answers: u32,
    restart_offers: u32,
    pending_local_offer: bool,
    applied: Vec<IceCandidate>,
    outgoing: HashMap<TrackKind, String>,
    replacements: u32,
    closed: bool,
}

pub struct FakeTransport {
    index: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<FakeState>,
    fail_restart: Arc<AtomicBool>,
}

impl FakeTransport {
    /// Schickt ein Engine-Event an den Manager
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// ICE-Pfad bricht weg
    pub fn fail(&self) {
        self.emit(TransportEvent::Ice(IceConnectionState::Failed));
        self.emit(TransportEvent::Link(LinkState::Failed));
    }

    pub fn drop_link(&self) {
        self.emit(TransportEvent::Ice(IceConnectionState::Disconnected));
        self.emit(TransportEvent::Link(LinkState::Disconnected));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn restart_offers(&self) -> u32 {
        self.state.lock().restart_offers
    }

    pub fn outgoing_track_id(&self, kind: TrackKind) -> Option<String> {
        self.state.lock().outgoing.get(&kind).cloned()
    }

    pub fn replacements(&self) -> u32 {
        self.state.lock().replacements
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(&self) -> Result<(), PeerError> {
        if self.state.lock().closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn start_gathering(&self) {
        self.emit(TransportEvent::Gathering(GatheringState::Gathering));
        self.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host",
            self.index,
            self.index + 1
        ))));
    }

    /// Verhandlung abgeschlossen: Verbindung läuft hoch
    fn complete(&self) {
        for event in [
            TransportEvent::Ice(IceConnectionState::Checking),
            TransportEvent::Link(LinkState::Connecting),
            TransportEvent::Gathering(GatheringState::Complete),
            TransportEvent::Ice(IceConnectionState::Connected),
            TransportEvent::Link(LinkState::Connected),
        ] {
            self.emit(event);
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        if ice_restart {
            state.restart_offers += 1;
            if self.fail_restart.load(Ordering::SeqCst) {
                return Err(PeerError::Engine("scripted ICE restart failure".to_string()));
            }
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 fake-offer {} {} restart={}",
            self.index, state.offers, ice_restart
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0 fake-answer {} {}",
            self.index, state.answers
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.check_open()?;
        match description.sdp_type {
            SdpType::Offer => {
                self.state.lock().pending_local_offer = true;
                self.start_gathering();
            }
            SdpType::Answer => {
                self.start_gathering();
                self.complete();
            }
            SdpType::Rollback => self.state.lock().pending_local_offer = false,
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.check_open()?;
        match description.sdp_type {
            SdpType::Offer => {
                if self.state.lock().pending_local_offer {
                    return Err(PeerError::InvalidState("have-local-offer".to_string()));
                }
            }
            SdpType::Answer => {
                {
                    let mut state = self.state.lock();
                    if !state.pending_local_offer {
                        return Err(PeerError::InvalidState("stable".to_string()));
                    }
                    state.pending_local_offer = false;
                }
                self.complete();
            }
            SdpType::Rollback => {}
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.check_open()?;
        self.state.lock().applied.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        self.check_open()?;
        self.state
            .lock()
            .outgoing
            .insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Arc<MediaTrack>,
    ) -> Result<(), PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        if !state.outgoing.contains_key(&kind) {
            return Err(PeerError::NoSender(kind));
        }
        state.outgoing.insert(kind, track.id().to_string());
        state.replacements += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.state.lock().pending_local_offer = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Erzeugt `FakeTransport`s und merkt sich alle
#[derive(Clone, Default)]
pub struct FakeTransportFactory {
    transports: Arc<Mutex<Vec<Arc<FakeTransport>>>>,
    fail_restart: Arc<AtomicBool>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport Nummer `index` in Erzeugungsreihenfolge
    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        Arc::clone(&self.transports.lock()[index])
    }

    pub fn latest(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn total_restart_offers(&self) -> u32 {
        self.transports.lock().iter().map(|t| t.restart_offers()).sum()
    }

    /// ICE-Restart Offers schlagen fehl solange `true`
    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let mut transports = self.transports.lock();
        let transport = Arc::new(FakeTransport {
            index: transports.len(),
            events,
            state: Mutex::new(FakeState::default()),
            fail_restart: Arc::clone(&self.fail_restart),
        });
        transports.push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

#[derive(Default)]
struct DeviceState {
    user_media_error: Option<DeviceErrorKind>,
    display_error: Option<DeviceErrorKind>,
    user_media_calls: usize,
    display_calls: usize,
    tracks: Vec<Arc<MediaTrack>>,
}

/// Geräte, die jeden ausgegebenen Track protokollieren
pub struct FakeDevices {
    state: Mutex<DeviceState>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeviceState::default()),
        })
    }

    /// Kamera/Mikrofon scheitern bis `clear_failures()`
    pub fn fail_user_media(&self, kind: DeviceErrorKind) {
        self.state.lock().user_media_error = Some(kind);
    }

    pub fn fail_display(&self, kind: DeviceErrorKind) {
        self.state.lock().display_error = Some(kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.user_media_error = None;
        state.display_error = None;
    }

    pub fn user_media_calls(&self) -> usize {
        self.state.lock().user_media_calls
    }

    pub fn display_calls(&self) -> usize {
        self.state.lock().display_calls
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.state.lock().tracks.clone()
    }

    pub fn live_track_count(&self) -> usize {
        self.state.lock().tracks.iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, DeviceError> {
        let mut state = self.state.lock();
        state.user_media_calls += 1;
        if let Some(kind) = state.user_media_error {
            return Err(DeviceError::new(kind, None, "scripted device failure"));
        }

        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(MediaTrack::local(
                TrackKind::Audio,
                TrackSource::Microphone,
                "fake-microphone",
            ));
        }
        if constraints.video.is_some() {
            tracks.push(MediaTrack::local(
                TrackKind::Video,
                TrackSource::Camera,
                "fake-camera",
            ));
        }
        state.tracks.extend(tracks.iter().cloned());
        Ok(MediaStreamHandle::new(StreamKind::Local, tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStreamHandle, DeviceError> {
        let mut state = self.state.lock();
        state.display_calls += 1;
        if let Some(kind) = state.display_error {
            return Err(DeviceError::new(
                kind,
                None,
                "scripted screen capture failure",
            ));
        }

        let track = MediaTrack::local(TrackKind::Video, TrackSource::Screen, "fake-screen");
        state.tracks.push(Arc::clone(&track));
        Ok(MediaStreamHandle::new(StreamKind::Screen, vec![track]))
    }
}
