//! Peer Connection Manager
//!
//! Genau eine verhandelbare Verbindung pro Raum:
//! - Offer/Answer mit Schutz gegen Aufrufe außerhalb der Reihenfolge
//! - Puffer für Remote-Candidates, die vor der Remote-Description ankommen
//! - ICE-Restart und Rollback (Glare)
//! - Ein einziger beobachtbarer `PeerConnectionState`

use super::state::{PeerConnectionState, TransportStatus};
use super::transport::{
    IceCandidate, PeerTransport, PeerTransportFactory, SdpType, SessionDescription,
    TransportEvent,
};
use crate::config::CallConfig;
use crate::media::{MediaStreamHandle, MediaTrack, StreamKind, TrackKind};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("A negotiation is already in progress")]
    NegotiationInProgress,

    #[error("This offer has already been answered")]
    OfferAlreadyAnswered,

    #[error("Invalid negotiation state: {0}")]
    InvalidState(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("No outgoing {0:?} track to replace")]
    NoSender(TrackKind),

    #[error("WebRTC error: {0}")]
    Engine(String),
}

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Ausgehende Seiteneffekte für den Coordinator
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokaler Candidate, muss über Signaling verschickt werden
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteStreamAvailable(MediaStreamHandle),
    RemoteStreamRemoved,
}

pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Negotiation {
    /// Eine Operation wartet gerade auf die Engine
    in_flight: bool,
    /// Lokales Offer gesetzt, Answer steht aus
    local_offer_pending: bool,
    remote_description_set: bool,
    /// SDP des zuletzt beantworteten Remote-Offers
    answered_offer: Option<String>,
    pending_candidates: VecDeque<IceCandidate>,
    ice_restarts: u32,
}

struct Shared {
    connection_id: Uuid,
    closed: AtomicBool,
    status: Mutex<TransportStatus>,
    state_tx: watch::Sender<PeerConnectionState>,
    remote: RwLock<Option<MediaStreamHandle>>,
    remote_announced: AtomicBool,
    on_event: PeerEventHandler,
}

// ============================================================================
// PEER CONNECTION MANAGER
// ============================================================================

pub struct PeerConnectionManager {
    shared: Arc<Shared>,
    transport: Arc<dyn PeerTransport>,
    negotiation: Mutex<Negotiation>,
    outgoing: RwLock<HashMap<TrackKind, Arc<MediaTrack>>>,
    max_pending_candidates: usize,
    ice_gathering_timeout: Duration,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnectionManager {
    /// Erstellt die Verbindung über die Factory
    ///
    /// `on_event` wird aus einem eigenen Task aufgerufen und darf nicht blockieren.
    pub async fn new(
        factory: &dyn PeerTransportFactory,
        config: &CallConfig,
        on_event: impl Fn(PeerEvent) + Send + Sync + 'static,
    ) -> Result<Self, PeerError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = factory.create(&config.ice, event_tx).await?;
        let (state_tx, _) = watch::channel(PeerConnectionState::New);

        let shared = Arc::new(Shared {
            connection_id: Uuid::new_v4(),
            closed: AtomicBool::new(false),
            status: Mutex::new(TransportStatus::default()),
            state_tx,
            remote: RwLock::new(None),
            remote_announced: AtomicBool::new(false),
            on_event: Arc::new(on_event),
        });

        let pump = tokio::spawn(Shared::pump(Arc::clone(&shared), event_rx));
        tracing::info!("Created peer connection {}", shared.connection_id);

        Ok(Self {
            shared,
            transport,
            negotiation: Mutex::new(Negotiation::default()),
            outgoing: RwLock::new(HashMap::new()),
            max_pending_candidates: config.ice.max_pending_candidates.max(1),
            ice_gathering_timeout: config.connection.ice_gathering_timeout(),
            pump_task: Mutex::new(Some(pump)),
            watchdog_task: Mutex::new(None),
        })
    }

    pub fn connection_id(&self) -> Uuid {
        self.shared.connection_id
    }

    pub fn state(&self) -> PeerConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Beobachtet den Verbindungsstatus
    pub fn watch_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Remote-Stream, nur solange die Verbindung `connecting` oder `connected` ist
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        if !self.state().carries_media() {
            return None;
        }
        self.shared.remote.read().clone()
    }

    pub fn has_pending_offer(&self) -> bool {
        self.negotiation.lock().local_offer_pending
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.negotiation.lock().pending_candidates.len()
    }

    pub fn ice_restart_count(&self) -> u32 {
        self.negotiation.lock().ice_restarts
    }

    pub fn outgoing_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.outgoing.read().get(&kind).cloned()
    }

    // ========================================================================
    // OUTGOING TRACKS
    // ========================================================================

    /// Hängt alle Tracks eines lokalen Streams an
    pub async fn add_stream(&self, stream: &MediaStreamHandle) -> Result<(), PeerError> {
        for track in stream.tracks() {
            self.add_track(track).await?;
        }
        Ok(())
    }

    pub async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.transport.add_track(Arc::clone(&track)).await?;
        self.outgoing.write().insert(track.kind(), track);
        Ok(())
    }

    /// Ersetzt den ausgehenden Track dieser Art ohne Neuverhandlung
    ///
    /// Gibt den bisherigen Track zurück; gestoppt wird er hier nicht.
    pub async fn replace_track(
        &self,
        track: Arc<MediaTrack>,
    ) -> Result<Option<Arc<MediaTrack>>, PeerError> {
        self.ensure_open()?;
        let kind = track.kind();
        self.transport.replace_track(kind, Arc::clone(&track)).await?;
        tracing::debug!("Replaced outgoing {:?} track with {}", kind, track.id());
        Ok(self.outgoing.write().insert(kind, track))
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    /// Erzeugt ein Offer und setzt es lokal
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.begin(|n| {
            if n.local_offer_pending {
                return Err(PeerError::NegotiationInProgress);
            }
            Ok(())
        })?;

        let result = self.local_offer(false).await;
        self.finish(|n| {
            if result.is_ok() {
                n.local_offer_pending = true;
            }
        });
        if result.is_ok() {
            self.arm_gathering_watchdog();
        }
        result
    }

    /// Beantwortet ein Remote-Offer
    ///
    /// Pro Offer nur einmal; während ein lokales Offer aussteht schlägt der
    /// Aufruf fehl (vorher `rollback()`).
    pub async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(PeerError::InvalidState(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }
        self.begin(|n| {
            if n.local_offer_pending {
                return Err(PeerError::NegotiationInProgress);
            }
            if n.answered_offer.as_deref() == Some(offer.sdp.as_str()) {
                return Err(PeerError::OfferAlreadyAnswered);
            }
            Ok(())
        })?;

        let offer_sdp = offer.sdp.clone();
        let result: Result<SessionDescription, PeerError> = async {
            self.transport.set_remote_description(offer).await?;
            self.negotiation.lock().remote_description_set = true;
            self.replay_candidates().await;

            let answer = self.transport.create_answer().await?;
            self.transport.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;

        self.finish(|n| {
            if result.is_ok() {
                n.answered_offer = Some(offer_sdp);
            }
        });
        if result.is_ok() {
            self.arm_gathering_watchdog();
        }
        result
    }

    /// Schließt die eigene Verhandlung mit der Answer der Gegenseite ab
    pub async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(PeerError::InvalidState(format!(
                "expected an answer, got {:?}",
                answer.sdp_type
            )));
        }
        self.begin(|n| {
            if !n.local_offer_pending {
                return Err(PeerError::InvalidState(
                    "no local offer is outstanding".to_string(),
                ));
            }
            Ok(())
        })?;

        let result = self.transport.set_remote_description(answer).await;
        self.finish(|n| {
            if result.is_ok() {
                n.local_offer_pending = false;
                n.remote_description_set = true;
            }
        });
        result?;

        self.replay_candidates().await;
        Ok(())
    }

    /// Wendet einen Remote-Candidate an oder puffert ihn
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        {
            let mut n = self.negotiation.lock();
            if !n.remote_description_set {
                if n.pending_candidates.len() >= self.max_pending_candidates {
                    n.pending_candidates.pop_front();
                    tracing::warn!(
                        "Candidate buffer full ({}), dropping oldest candidate",
                        self.max_pending_candidates
                    );
                }
                n.pending_candidates.push_back(candidate);
                tracing::debug!(
                    "Buffered remote candidate ({} pending)",
                    n.pending_candidates.len()
                );
                return Ok(());
            }
        }

        self.transport.add_ice_candidate(candidate).await
    }

    /// Neues Offer mit ICE-Restart; ein ausstehendes Offer wird ersetzt
    pub async fn restart_ice(&self) -> Result<SessionDescription, PeerError> {
        self.begin(|_| Ok(()))?;

        let result = self.local_offer(true).await;
        self.finish(|n| {
            n.ice_restarts += 1;
            if result.is_ok() {
                n.local_offer_pending = true;
            }
        });
        if result.is_ok() {
            tracing::info!(
                "ICE restart offer created for connection {}",
                self.shared.connection_id
            );
        }
        result
    }

    /// Verwirft das eigene ausstehende Offer; ohne Offer ein No-op
    pub async fn rollback(&self) -> Result<(), PeerError> {
        self.begin(|_| Ok(()))?;
        let pending = self.negotiation.lock().local_offer_pending;
        let result = if pending {
            self.transport.rollback().await
        } else {
            Ok(())
        };
        self.finish(|n| {
            if result.is_ok() {
                n.local_offer_pending = false;
            }
        });
        result
    }

    /// Gibt alle Ressourcen frei; danach ist jede Operation ungültig
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.watchdog_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.pump_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Error while closing peer connection: {}", e);
        }

        self.negotiation.lock().pending_candidates.clear();
        self.outgoing.write().clear();
        let remote = self.shared.remote.write().take();
        if let Some(remote) = remote {
            remote.stop_all();
        }

        self.shared.state_tx.send_replace(PeerConnectionState::Closed);
        (self.shared.on_event)(PeerEvent::StateChanged(PeerConnectionState::Closed));
        tracing::info!("Closed peer connection {}", self.shared.connection_id);
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn begin(
        &self,
        check: impl FnOnce(&Negotiation) -> Result<(), PeerError>,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        let mut n = self.negotiation.lock();
        if n.in_flight {
            return Err(PeerError::NegotiationInProgress);
        }
        check(&n)?;
        n.in_flight = true;
        Ok(())
    }

    fn finish(&self, update: impl FnOnce(&mut Negotiation)) {
        let mut n = self.negotiation.lock();
        n.in_flight = false;
        update(&mut n);
    }

    async fn local_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let offer = self.transport.create_offer(ice_restart).await?;
        self.transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Gepufferte Candidates in Ankunftsreihenfolge anwenden
    async fn replay_candidates(&self) {
        loop {
            let next = self.negotiation.lock().pending_candidates.pop_front();
            let Some(candidate) = next else {
                break;
            };
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered candidate: {}", e);
            }
        }
    }

    /// Nur eine Warnung, die Verbindung wird nicht abgebaut
    fn arm_gathering_watchdog(&self) {
        let mut slot = self.watchdog_task.lock();
        if slot.is_some() {
            return;
        }

        let timeout = self.ice_gathering_timeout;
        let mut state_rx = self.shared.state_tx.subscribe();
        let connection_id = self.shared.connection_id;
        *slot = Some(tokio::spawn(async move {
            let progressed = tokio::time::timeout(
                timeout,
                state_rx.wait_for(|s| {
                    !matches!(s, PeerConnectionState::New | PeerConnectionState::Gathering)
                }),
            )
            .await;
            if progressed.is_err() {
                tracing::warn!(
                    "Connection {} still gathering candidates after {:?}",
                    connection_id,
                    timeout
                );
            }
        }));
    }
}

impl Shared {
    /// Übersetzt Engine-Events in Status und PeerEvents
    async fn pump(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            match event {
                TransportEvent::LocalCandidate(candidate) => {
                    (shared.on_event)(PeerEvent::LocalCandidate(candidate));
                }
                TransportEvent::Gathering(state) => shared.update_status(|s| s.gathering = state),
                TransportEvent::Ice(state) => shared.update_status(|s| s.ice = state),
                TransportEvent::Link(state) => shared.update_status(|s| s.link = state),
                TransportEvent::RemoteTrack(track) => {
                    {
                        let mut remote = shared.remote.write();
                        match remote.as_ref() {
                            Some(stream) => {
                                stream.replace_track(track);
                            }
                            None => {
                                *remote = Some(MediaStreamHandle::new(StreamKind::Remote, vec![track]));
                            }
                        }
                    }
                    shared.announce_remote();
                }
            }
        }
    }

    fn update_status(&self, update: impl FnOnce(&mut TransportStatus)) {
        let derived = {
            let mut status = self.status.lock();
            update(&mut status);
            status.derive()
        };

        let previous = self.state_tx.send_replace(derived);
        if previous == derived {
            return;
        }
        tracing::info!(
            "Connection {} state: {:?} -> {:?}",
            self.connection_id,
            previous,
            derived
        );
        (self.on_event)(PeerEvent::StateChanged(derived));

        if derived.carries_media() {
            self.announce_remote();
        } else if self.remote_announced.swap(false, Ordering::SeqCst) {
            (self.on_event)(PeerEvent::RemoteStreamRemoved);
        }
    }

    fn announce_remote(&self) {
        if !self.state_tx.borrow().carries_media() {
            return;
        }
        let Some(stream) = self.remote.read().clone() else {
            return;
        };
        self.remote_announced.store(true, Ordering::SeqCst);
        (self.on_event)(PeerEvent::RemoteStreamAvailable(stream));
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("connection_id", &self.shared.connection_id)
            .field("state", &self.state())
            .field("has_pending_offer", &self.has_pending_offer())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::testing::FakeTransportFactory;

    async fn manager(factory: &FakeTransportFactory) -> (PeerConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(factory, &CallConfig::default(), move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();
        (manager, rx)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_connected() {
        let factory = FakeTransportFactory::new();
        let (alice, _alice_events) = manager(&factory).await;
        let (bob, _bob_events) = manager(&factory).await;

        let offer = alice.create_offer().await.unwrap();
        let answer = bob.create_answer(offer).await.unwrap();
        alice.set_remote_answer(answer).await.unwrap();

        let mut alice_state = alice.watch_state();
        let mut bob_state = bob.watch_state();
        alice_state
            .wait_for(|s| *s == PeerConnectionState::Connected)
            .await
            .unwrap();
        bob_state
            .wait_for(|s| *s == PeerConnectionState::Connected)
            .await
            .unwrap();
        assert!(!alice.has_pending_offer());
    }

    #[tokio::test]
    async fn test_second_offer_while_pending_fails() {
        let factory = FakeTransportFactory::new();
        let (alice, _events) = manager(&factory).await;

        alice.create_offer().await.unwrap();
        let err = alice.create_offer().await.unwrap_err();
        assert!(matches!(err, PeerError::NegotiationInProgress));
    }

    #[tokio::test]
    async fn test_same_offer_cannot_be_answered_twice() {
        let factory = FakeTransportFactory::new();
        let (bob, _events) = manager(&factory).await;

        let offer = SessionDescription::offer("v=0 fake-offer-1");
        bob.create_answer(offer.clone()).await.unwrap();
        let err = bob.create_answer(offer).await.unwrap_err();
        assert!(matches!(err, PeerError::OfferAlreadyAnswered));

        // Ein neues Offer (z.B. nach ICE-Restart) darf beantwortet werden
        bob.create_answer(SessionDescription::offer("v=0 fake-offer-2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_invalid_state() {
        let factory = FakeTransportFactory::new();
        let (alice, _events) = manager(&factory).await;

        let err = alice
            .set_remote_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_early_candidates_replayed_in_order() {
        let factory = FakeTransportFactory::new();
        let (bob, _events) = manager(&factory).await;

        for n in 1..=3 {
            bob.add_remote_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(bob.pending_candidate_count(), 3);
        assert!(factory.transport(0).applied_candidates().is_empty());

        bob.create_answer(SessionDescription::offer("v=0 fake-offer"))
            .await
            .unwrap();
        bob.add_remote_candidate(candidate(4)).await.unwrap();

        assert_eq!(bob.pending_candidate_count(), 0);
        assert_eq!(
            factory.transport(0).applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3), candidate(4)]
        );
    }

    #[tokio::test]
    async fn test_candidate_buffer_drops_oldest_at_cap() {
        let factory = FakeTransportFactory::new();
        let mut config = CallConfig::default();
        config.ice.max_pending_candidates = 2;
        let bob = PeerConnectionManager::new(&factory, &config, |_| {})
            .await
            .unwrap();

        for n in 1..=3 {
            bob.add_remote_candidate(candidate(n)).await.unwrap();
        }
        bob.create_answer(SessionDescription::offer("v=0 fake-offer"))
            .await
            .unwrap();

        assert_eq!(
            factory.transport(0).applied_candidates(),
            vec![candidate(2), candidate(3)]
        );
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let factory = FakeTransportFactory::new();
        let (alice, mut events) = manager(&factory).await;
        alice.create_offer().await.unwrap();

        factory.transport(0).emit(TransportEvent::LocalCandidate(candidate(7)));
        loop {
            if let PeerEvent::LocalCandidate(c) = events.recv().await.unwrap() {
                if c == candidate(7) {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_restart_ice_sets_restart_flag() {
        let factory = FakeTransportFactory::new();
        let (alice, _events) = manager(&factory).await;

        alice.create_offer().await.unwrap();
        let offer = alice.restart_ice().await.unwrap();

        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(alice.has_pending_offer());
        assert_eq!(alice.ice_restart_count(), 1);
        assert_eq!(factory.transport(0).restart_offers(), 1);
    }

    #[tokio::test]
    async fn test_rollback_clears_pending_offer() {
        let factory = FakeTransportFactory::new();
        let (alice, _events) = manager(&factory).await;

        alice.rollback().await.unwrap();
        alice.create_offer().await.unwrap();
        alice.rollback().await.unwrap();
        assert!(!alice.has_pending_offer());

        alice
            .create_answer(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remote_stream_only_while_connected() {
        let factory = FakeTransportFactory::new();
        let (bob, mut events) = manager(&factory).await;
        let transport = factory.transport(0);

        transport.emit(TransportEvent::RemoteTrack(MediaTrack::remote("r1", TrackKind::Video)));
        transport.emit(TransportEvent::Link(crate::peer::LinkState::Connected));
        loop {
            if let PeerEvent::RemoteStreamAvailable(stream) = events.recv().await.unwrap() {
                assert_eq!(stream.kind(), StreamKind::Remote);
                break;
            }
        }
        assert!(bob.remote_stream().is_some());

        transport.emit(TransportEvent::Link(crate::peer::LinkState::Failed));
        loop {
            if let PeerEvent::RemoteStreamRemoved = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(bob.state(), PeerConnectionState::Failed);
        assert!(bob.remote_stream().is_none());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let factory = FakeTransportFactory::new();
        let (alice, _events) = manager(&factory).await;
        let camera = MediaTrack::local(TrackKind::Video, TrackSource::Camera, "cam");
        alice.add_track(camera).await.unwrap();

        alice.close().await;
        alice.close().await;

        assert_eq!(alice.state(), PeerConnectionState::Closed);
        assert!(factory.transport(0).is_closed());
        assert!(matches!(alice.create_offer().await, Err(PeerError::Closed)));
        assert!(matches!(
            alice.add_remote_candidate(candidate(1)).await,
            Err(PeerError::Closed)
        ));
        assert!(alice.outgoing_track(TrackKind::Video).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_watchdog_does_not_tear_down() {
        let factory = FakeTransportFactory::new();
        let (alice, _events) = manager(&factory).await;
        alice.create_offer().await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(alice.state(), PeerConnectionState::Gathering);
        assert!(!alice.is_closed());
    }
}
