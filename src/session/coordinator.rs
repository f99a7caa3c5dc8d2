//! Session Coordinator
//!
//! Setzt Signaling, Peer Connection, Medien, Bildschirmfreigabe und Aufnahme
//! zu genau einer Interview-Sitzung pro Raum zusammen.
//!
//! Alle Eingaben (Signaling-Nachrichten, Peer-Events, Kanal-Events, Timer)
//! laufen durch eine Queue und werden von einer einzigen Event-Loop in
//! Ankunftsreihenfolge verarbeitet. Öffentliche Operationen und die Loop
//! teilen sich `op_lock`, damit nie zwei Handler gleichzeitig am Zustand
//! arbeiten.
//!
//! Recovery bei Verbindungsverlust:
//! 1. `disconnected` wird `disconnect_grace` lang toleriert
//! 2. `failed` (oder Grace abgelaufen): ICE-Restart, Offer erneut senden
//! 3. Restart wirft: kompletter Neuaufbau nach dem Backoff-Delay
//! 4. Jeder Versuch hat `connection_timeout` Zeit; danach folgt der nächste
//!    Neuaufbau, auch wenn die Gegenseite nie antwortet
//! 5. Budget erschöpft: `Failed`, bis `retry()` aufgerufen wird

use super::error::{CallError, ErrorCallback, ErrorReport};
use super::state::{
    ConnectionStatus, RemoteMediaState, SessionEvent, SessionPhase, SessionSnapshot,
    SessionState,
};
use crate::config::CallConfig;
use crate::media::{
    CpalMediaDevices, MediaDevices, MediaManager, MediaStreamHandle, QualityTier, TrackKind,
};
use crate::peer::{
    PeerConnectionManager, PeerConnectionState, PeerEvent, PeerTransportFactory,
    RtcTransportFactory, SessionDescription,
};
use crate::recording::{RecordingArtifact, RecordingController};
use crate::screen_share::{CameraRestore, ScreenShareController, ShareEvent};
use crate::signaling::{
    CandidatePayload, ChannelEvent, Credentials, DescriptionPayload, JoinPayload, LeavePayload,
    MediaStatePayload, MessageKind, ScreenSharePayload, SignalingClient, SignalingMessage,
    SubscriptionId, WebSocketConnector,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 100;

// ============================================================================
// INPUTS
// ============================================================================

/// Alles, was die Event-Loop verarbeitet
#[derive(Debug)]
enum SessionInput {
    Signal(SignalingMessage),
    /// `generation` verwirft Events einer bereits ersetzten Verbindung
    Peer { generation: u64, event: PeerEvent },
    Channel(ChannelEvent),
    Share(ShareEvent),
    DisconnectTimeout { generation: u64 },
    RetryRecovery { generation: u64 },
    /// Recovery-Versuch kam nicht rechtzeitig auf `connected`
    AttemptTimeout { generation: u64 },
}

#[derive(Default)]
struct Timers {
    grace: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    attempt: Option<JoinHandle<()>>,
}

/// Bei Glare gibt die Seite mit der größeren User-ID nach
fn is_polite(local_user_id: &str, remote_user_id: &str) -> bool {
    local_user_id > remote_user_id
}

fn parse_payload<T: DeserializeOwned>(message: &SignalingMessage) -> Option<T> {
    match message.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(
                "Ignoring malformed {} payload from {}: {}",
                message.kind,
                message.sender_id,
                e
            );
            None
        }
    }
}

// ============================================================================
// SESSION COORDINATOR
// ============================================================================

struct CoordinatorInner {
    config: CallConfig,
    local_user_id: String,
    signaling: SignalingClient,
    media: Arc<MediaManager>,
    peer_factory: Arc<dyn PeerTransportFactory>,
    share: ScreenShareController,
    recorder: RecordingController,
    state: RwLock<SessionState>,
    peer: RwLock<Option<Arc<PeerConnectionManager>>>,
    peer_generation: AtomicU64,
    local: RwLock<Option<MediaStreamHandle>>,
    remote: RwLock<Option<MediaStreamHandle>>,
    input_tx: Mutex<Option<mpsc::UnboundedSender<SessionInput>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    timers: Mutex<Timers>,
    subscriptions: Mutex<Vec<(MessageKind, SubscriptionId)>>,
    event_tx: broadcast::Sender<SessionEvent>,
    error_callback: RwLock<Option<ErrorCallback>>,
    op_lock: tokio::sync::Mutex<()>,
}

/// Eine Interview-Sitzung: `initialize` → Steuer-Operationen → `end_call`
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SessionCoordinator {
    pub fn new(
        config: CallConfig,
        signaling: SignalingClient,
        devices: Arc<dyn MediaDevices>,
        peer_factory: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        let media = Arc::new(MediaManager::new(devices, config.default_quality));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = SessionState {
            quality: config.default_quality,
            ..Default::default()
        };

        Self {
            inner: Arc::new(CoordinatorInner {
                local_user_id: signaling.local_user_id().to_string(),
                share: ScreenShareController::new(Arc::clone(&media)),
                recorder: RecordingController::new(config.recording.clone()),
                config,
                signaling,
                media,
                peer_factory,
                state: RwLock::new(state),
                peer: RwLock::new(None),
                peer_generation: AtomicU64::new(0),
                local: RwLock::new(None),
                remote: RwLock::new(None),
                input_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                timers: Mutex::new(Timers::default()),
                subscriptions: Mutex::new(Vec::new()),
                event_tx,
                error_callback: RwLock::new(None),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Produktions-Setup: WebSocket-Relay, cpal-Geräte, webrtc-rs Engine
    pub fn with_system_backends(
        config: CallConfig,
        local_user_id: impl Into<String>,
    ) -> Result<Self, CallError> {
        let url = config.signaling_url()?;
        let connector = Arc::new(WebSocketConnector::new(
            config.connection.heartbeat_interval(),
        ));
        let signaling = SignalingClient::new(url, local_user_id, connector, &config.connection);

        Ok(Self::new(
            config,
            signaling,
            Arc::new(CpalMediaDevices::new()),
            Arc::new(RtcTransportFactory),
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Einziger Fehlerkanal zur UI, neben `SessionEvent::Error`
    pub fn set_error_callback(&self, callback: impl Fn(&ErrorReport) + Send + Sync + 'static) {
        *self.inner.error_callback.write() = Some(Arc::new(callback));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.read().snapshot(&self.inner.local_user_id)
    }

    pub fn last_error(&self) -> Option<ErrorReport> {
        self.inner.state.read().last_error.clone()
    }

    pub fn media(&self) -> &MediaManager {
        &self.inner.media
    }

    pub fn local_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.local_stream()
    }

    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.remote.read().clone()
    }

    pub fn screen_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.share.screen_stream()
    }

    pub fn peer_state(&self) -> Option<PeerConnectionState> {
        self.inner.current_peer().map(|p| p.state())
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Betritt den Raum und wartet auf die Gegenseite
    ///
    /// Verbindet den Signaling-Kanal, öffnet Kamera und Mikrofon in der
    /// Standard-Stufe und kündigt sich mit `join` an. Verhandelt wird erst,
    /// wenn ein `join` der Gegenseite eintrifft. Ein zweiter Aufruf während
    /// einer laufenden Sitzung schlägt fehl.
    pub async fn initialize(
        &self,
        room_id: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Result<(), CallError> {
        let room_id = room_id.into();
        let _op = self.inner.op_lock.lock().await;

        {
            let mut state = self.inner.state.write();
            if !state.phase.can_initialize() {
                tracing::warn!("initialize() called while session is {:?}", state.phase);
                return Err(CallError::AlreadyActive(state.phase));
            }
            *state = SessionState {
                phase: SessionPhase::Initializing,
                room_id: Some(room_id.clone()),
                quality: self.inner.config.default_quality,
                credentials: credentials.clone(),
                ..Default::default()
            };
        }
        self.inner.emit(SessionEvent::PhaseChanged(SessionPhase::Initializing));
        tracing::info!(
            "Joining room {} as {}",
            room_id,
            self.inner.local_user_id
        );

        match self.inner.start(room_id, credentials).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.abort_start();
                self.inner.report(&e);
                Err(e)
            }
        }
    }

    /// Beendet die Sitzung und gibt alle Geräte frei
    ///
    /// Reihenfolge: Aufnahme stoppen, Bildschirmfreigabe stoppen, alle
    /// lokalen Tracks stoppen, Peer Connection schließen, `leave` senden und
    /// Kanal trennen, UI-Schalter zurücksetzen. Ohne aktive Sitzung ein No-op.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let _op = self.inner.op_lock.lock().await;

        {
            let mut state = self.inner.state.write();
            if state.phase != SessionPhase::Active {
                return Ok(());
            }
            state.phase = SessionPhase::Ending;
        }
        self.inner.emit(SessionEvent::PhaseChanged(SessionPhase::Ending));

        self.inner.shutdown().await;
        Ok(())
    }

    /// Verlässt den terminalen `Failed`-Status und baut neu auf
    pub async fn retry(&self) -> Result<(), CallError> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_active()?;

        {
            let mut state = self.inner.state.write();
            if state.status != ConnectionStatus::Failed {
                return Ok(());
            }
            state.reconnect_attempts = 0;
        }
        tracing::info!("Retrying call after terminal failure");

        let result = self.inner.reconnect_session().await;
        if let Err(e) = &result {
            self.inner.set_status(ConnectionStatus::Failed);
            self.inner.report(e);
        }
        result
    }

    // ========================================================================
    // LOCAL MEDIA CONTROLS
    // ========================================================================

    /// Schaltet das Mikrofon um, gibt den neuen Zustand zurück
    pub fn toggle_audio(&self) -> Result<bool, CallError> {
        self.inner.toggle(TrackKind::Audio)
    }

    /// Schaltet die Kamera um, gibt den neuen Zustand zurück
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.inner.toggle(TrackKind::Video)
    }

    /// Neue Qualitätsstufe ohne Neuverhandlung
    pub async fn change_quality(&self, tier: QualityTier) -> Result<(), CallError> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_active()?;
        let result = self.inner.switch_quality(tier).await;
        self.inner.reported(result)
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_active()?;
        let result = self.inner.start_share().await;
        self.inner.reported(result)
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_active()?;
        let result = self.inner.stop_share().await;
        self.inner.reported(result)
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    pub async fn start_recording(&self) -> Result<(), CallError> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_active()?;

        let local = self.inner.local_stream();
        let result = self
            .inner
            .recorder
            .start_recording(local.as_ref())
            .map_err(CallError::from);
        if result.is_ok() {
            self.inner.state.write().recording = true;
            self.inner.emit(SessionEvent::RecordingChanged(true));
        }
        self.inner.reported(result)
    }

    /// Stoppt die Aufnahme; ohne Chunks schlägt das mit `EmptyRecording` fehl
    pub async fn stop_recording(&self) -> Result<(), CallError> {
        let _op = self.inner.op_lock.lock().await;
        let result = self.inner.finish_recording().await;
        self.inner.reported(result)
    }

    /// Übergibt das Artefakt, z.B. für einen Upload
    pub fn take_recording(&self) -> Result<RecordingArtifact, CallError> {
        let result = self.inner.recorder.take_recording().map_err(CallError::from);
        self.inner.reported(result)
    }

    /// Schreibt die Aufnahme nach `dir` (Standard: Downloads-Ordner)
    pub async fn download_recording(&self, dir: Option<&Path>) -> Result<PathBuf, CallError> {
        let result = self
            .inner
            .recorder
            .download_recording(dir)
            .await
            .map_err(CallError::from);
        self.inner.reported(result)
    }

    pub fn discard_recording(&self) {
        self.inner.recorder.discard_recording();
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.inner.release_without_peer();
        self.inner.close_peer_detached();
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("SessionCoordinator")
            .field("local_user_id", &self.inner.local_user_id)
            .field("room_id", &state.room_id)
            .field("phase", &state.phase)
            .field("status", &state.status)
            .finish()
    }
}

// ============================================================================
// INNER: SETUP & TEARDOWN
// ============================================================================

impl CoordinatorInner {
    async fn start(
        self: &Arc<Self>,
        room_id: String,
        credentials: Option<Credentials>,
    ) -> Result<(), CallError> {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        *self.input_tx.lock() = Some(input_tx.clone());

        // Handler vor dem Connect registrieren, die Queue puffert bis die Loop läuft
        self.signaling.set_room(Some(room_id));
        self.subscribe_signaling(&input_tx);
        self.spawn_forwarders(&input_tx);

        self.signaling.connect(credentials).await?;
        let local = self.media.acquire_local_media(self.config.default_quality).await?;

        {
            let mut state = self.state.write();
            state.audio_enabled = local.is_enabled(TrackKind::Audio);
            state.video_enabled = local.is_enabled(TrackKind::Video);
            state.phase = SessionPhase::Active;
        }
        *self.local.write() = Some(local);

        self.announce();
        let run = tokio::spawn(Self::run(Arc::clone(self), input_rx));
        self.tasks.lock().push(run);

        self.emit(SessionEvent::PhaseChanged(SessionPhase::Active));
        tracing::info!("Session active, waiting for remote participant");
        Ok(())
    }

    fn subscribe_signaling(&self, input_tx: &mpsc::UnboundedSender<SessionInput>) {
        let mut subscriptions = self.subscriptions.lock();
        for kind in MessageKind::ALL {
            let tx = input_tx.clone();
            let id = self.signaling.subscribe(kind, move |message| {
                let _ = tx.send(SessionInput::Signal(message.clone()));
            });
            subscriptions.push((kind, id));
        }
    }

    fn unsubscribe_signaling(&self) {
        let subscriptions: Vec<_> = self.subscriptions.lock().drain(..).collect();
        for (kind, id) in subscriptions {
            self.signaling.unsubscribe(kind, id);
        }
    }

    /// Kanal- und Share-Events in die Queue umleiten
    fn spawn_forwarders(&self, input_tx: &mpsc::UnboundedSender<SessionInput>) {
        let mut channel_events = self.signaling.subscribe_events();
        let tx = input_tx.clone();
        let channel = tokio::spawn(async move {
            loop {
                match channel_events.recv().await {
                    Ok(event) => {
                        if tx.send(SessionInput::Channel(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} signaling channel events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut share_events = self.share.subscribe();
        let tx = input_tx.clone();
        let share = tokio::spawn(async move {
            loop {
                match share_events.recv().await {
                    Ok(event) => {
                        if tx.send(SessionInput::Share(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} screen share events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().extend([channel, share]);
    }

    /// Macht einen fehlgeschlagenen `initialize` rückgängig
    fn abort_start(&self) {
        self.release_without_peer();
        self.signaling.set_room(None);

        {
            let mut state = self.state.write();
            state.reset_toggles();
            state.phase = SessionPhase::Idle;
            state.room_id = None;
            state.credentials = None;
        }
        self.emit(SessionEvent::PhaseChanged(SessionPhase::Idle));
    }

    /// Alles freigeben, was ohne `.await` geht
    fn release_without_peer(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.cancel_timers();
        *self.input_tx.lock() = None;
        self.unsubscribe_signaling();
        self.share.release();
        let local = self.local.write().take();
        if let Some(local) = local {
            local.stop_all();
        }
        self.signaling.disconnect();
    }

    /// Schließt die Verbindung ohne `.await` (Drop ohne `end_call`)
    fn close_peer_detached(&self) {
        self.peer_generation.fetch_add(1, Ordering::SeqCst);
        let Some(peer) = self.peer.write().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { peer.close().await });
            }
            Err(_) => tracing::warn!(
                "Peer connection {} dropped outside a runtime, not closed",
                peer.connection_id()
            ),
        }
    }

    async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.cancel_timers();
        *self.input_tx.lock() = None;

        let was_recording = self.recorder.is_recording();
        if was_recording {
            if let Err(e) = self.recorder.stop_recording().await {
                tracing::warn!("Recording ended without a usable artifact: {}", e);
            }
        }

        let was_sharing = self.share.is_sharing();
        self.share.release();

        let local = self.local.write().take();
        if let Some(local) = local {
            local.stop_all();
        }

        self.teardown_peer().await;

        self.signaling.send(
            MessageKind::Leave,
            &LeavePayload {
                user_id: self.local_user_id.clone(),
            },
        );
        self.unsubscribe_signaling();
        self.signaling.disconnect();
        self.signaling.set_room(None);

        {
            let mut state = self.state.write();
            state.reset_toggles();
            state.phase = SessionPhase::Ended;
            state.credentials = None;
        }

        if was_recording {
            self.emit(SessionEvent::RecordingChanged(false));
        }
        if was_sharing {
            self.emit(SessionEvent::ScreenShareChanged(false));
        }
        self.emit(SessionEvent::ConnectionStatusChanged(
            ConnectionStatus::Disconnected,
        ));
        self.emit(SessionEvent::PhaseChanged(SessionPhase::Ended));
        tracing::info!("Call ended, all media released");
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    async fn run(self: Arc<Self>, mut input_rx: mpsc::UnboundedReceiver<SessionInput>) {
        while let Some(input) = input_rx.recv().await {
            let _op = self.op_lock.lock().await;
            if self.state.read().phase != SessionPhase::Active {
                continue;
            }
            if let Err(e) = self.handle_input(input).await {
                self.report(&e);
            }
        }
        tracing::debug!("Session event loop finished");
    }

    async fn handle_input(&self, input: SessionInput) -> Result<(), CallError> {
        match input {
            SessionInput::Signal(message) => self.handle_signal(message).await,
            SessionInput::Peer { generation, event } => {
                if generation != self.peer_generation.load(Ordering::SeqCst) {
                    return Ok(());
                }
                self.handle_peer_event(event).await
            }
            SessionInput::Channel(event) => self.handle_channel_event(event).await,
            SessionInput::Share(ShareEvent::EndedExternally { generation }) => {
                if generation == self.share.generation() && self.share.is_sharing() {
                    tracing::info!("Screen capture ended externally, restoring camera");
                    self.stop_share().await?;
                }
                Ok(())
            }
            SessionInput::Share(_) => Ok(()),
            SessionInput::DisconnectTimeout { generation } => {
                if generation != self.peer_generation.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let still_down = self
                    .current_peer()
                    .is_some_and(|p| p.state() == PeerConnectionState::Disconnected);
                if still_down {
                    tracing::warn!(
                        "Connection stayed disconnected for {:?}",
                        self.config.connection.disconnect_grace()
                    );
                    self.recover().await?;
                }
                Ok(())
            }
            SessionInput::RetryRecovery { generation } => {
                if generation != self.peer_generation.load(Ordering::SeqCst)
                    || self.state.read().status != ConnectionStatus::Reconnecting
                {
                    return Ok(());
                }
                self.rebuild().await
            }
            SessionInput::AttemptTimeout { generation } => {
                let stalled = generation == self.peer_generation.load(Ordering::SeqCst)
                    && self.state.read().status == ConnectionStatus::Reconnecting
                    && self
                        .current_peer()
                        .map_or(true, |p| p.state() != PeerConnectionState::Connected);
                if !stalled {
                    return Ok(());
                }
                self.on_attempt_timeout().await
            }
        }
    }

    // ========================================================================
    // SIGNALING HANDLERS
    // ========================================================================

    async fn handle_signal(&self, message: SignalingMessage) -> Result<(), CallError> {
        tracing::debug!("Handling {} from {}", message.kind, message.sender_id);

        match message.kind {
            MessageKind::Join => self.on_join(message).await,
            MessageKind::Offer => self.on_offer(message).await,
            MessageKind::Answer => self.on_answer(message).await,
            MessageKind::IceCandidate => self.on_candidate(message).await,
            MessageKind::Leave => {
                self.on_leave(message).await;
                Ok(())
            }
            MessageKind::MediaStateChange => {
                if let Some(payload) = parse_payload::<MediaStatePayload>(&message) {
                    if !self.is_foreign(&message.sender_id) {
                        self.update_remote_media(|media| {
                            media.audio_enabled = payload.audio_enabled;
                            media.video_enabled = payload.video_enabled;
                        });
                    }
                }
                Ok(())
            }
            MessageKind::ScreenShareStart | MessageKind::ScreenShareStop => {
                if !self.is_foreign(&message.sender_id) {
                    let sharing = message.kind == MessageKind::ScreenShareStart;
                    self.update_remote_media(|media| media.screen_sharing = sharing);
                }
                Ok(())
            }
        }
    }

    /// Wer ein `join` empfängt, erzeugt das Offer
    async fn on_join(&self, message: SignalingMessage) -> Result<(), CallError> {
        let Some(join) = parse_payload::<JoinPayload>(&message) else {
            return Ok(());
        };
        let user_id = join.user_id;

        let (status, known) = {
            let state = self.state.read();
            (state.status, state.remote_user_id.clone())
        };
        if status == ConnectionStatus::Failed {
            tracing::info!("Ignoring join from {} until retry", user_id);
            return Ok(());
        }
        match known.as_deref() {
            Some(known) if known != user_id && status != ConnectionStatus::Disconnected => {
                tracing::warn!("Ignoring join from {}, already in a call with {}", user_id, known);
                return Ok(());
            }
            Some(known) if known == user_id && status == ConnectionStatus::Connected => {
                tracing::debug!("Already connected to {}, ignoring join", user_id);
                return Ok(());
            }
            _ => {}
        }

        tracing::info!(
            "Remote participant {} joined{}",
            user_id,
            join.display_name
                .map(|name| format!(" ({name})"))
                .unwrap_or_default()
        );
        {
            let mut state = self.state.write();
            state.remote_user_id = Some(user_id.clone());
            state.remote_connection_id = None;
            state.reconnect_attempts = 0;
            state.remote_media = RemoteMediaState::default();
        }
        self.emit(SessionEvent::RemoteJoined { user_id });
        self.set_status(ConnectionStatus::Connecting);

        self.start_negotiation().await
    }

    async fn on_offer(&self, message: SignalingMessage) -> Result<(), CallError> {
        let Some(payload) = parse_payload::<DescriptionPayload>(&message) else {
            return Ok(());
        };
        let sender = message.sender_id;
        if self.is_foreign(&sender) {
            tracing::warn!("Ignoring offer from unexpected participant {}", sender);
            return Ok(());
        }

        let (status, known_connection, adopted) = {
            let mut state = self.state.write();
            let adopted = state.remote_user_id.is_none();
            if adopted {
                state.remote_user_id = Some(sender.clone());
            }
            (state.status, state.remote_connection_id.clone(), adopted)
        };
        if status == ConnectionStatus::Failed {
            tracing::info!("Ignoring offer from {} until retry", sender);
            return Ok(());
        }
        if adopted {
            self.emit(SessionEvent::RemoteJoined {
                user_id: sender.clone(),
            });
        }

        let replaced = matches!(
            (&known_connection, &payload.connection_id),
            (Some(known), Some(incoming)) if known != incoming
        );

        let peer = match self.current_peer().filter(|p| !p.is_closed()) {
            Some(peer) if !replaced => {
                if peer.has_pending_offer() {
                    if !is_polite(&self.local_user_id, &sender) {
                        tracing::info!("Offer collision with {}, keeping local offer", sender);
                        return Ok(());
                    }
                    tracing::info!("Offer collision with {}, rolling back local offer", sender);
                    peer.rollback().await?;
                }
                peer
            }
            _ => {
                if replaced {
                    tracing::info!("{} opened a new connection, rebuilding ours", sender);
                }
                self.create_peer().await?
            }
        };

        self.state.write().remote_connection_id = payload.connection_id;
        if status == ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Connecting);
        }

        let answer = peer.create_answer(payload.description).await?;
        self.send_description(MessageKind::Answer, answer, &peer);
        Ok(())
    }

    async fn on_answer(&self, message: SignalingMessage) -> Result<(), CallError> {
        let Some(payload) = parse_payload::<DescriptionPayload>(&message) else {
            return Ok(());
        };
        if self.is_foreign(&message.sender_id) {
            tracing::warn!("Ignoring answer from unexpected participant {}", message.sender_id);
            return Ok(());
        }
        let Some(peer) = self.current_peer() else {
            tracing::warn!("Answer from {} without a peer connection", message.sender_id);
            return Ok(());
        };

        peer.set_remote_answer(payload.description).await?;
        self.state.write().remote_connection_id = payload.connection_id;
        Ok(())
    }

    /// Candidates vor ihrer Description landen im Puffer der Verbindung
    async fn on_candidate(&self, message: SignalingMessage) -> Result<(), CallError> {
        let Some(payload) = parse_payload::<CandidatePayload>(&message) else {
            return Ok(());
        };
        if self.is_foreign(&message.sender_id)
            || self.state.read().status == ConnectionStatus::Failed
        {
            return Ok(());
        }

        let peer = match self.current_peer().filter(|p| !p.is_closed()) {
            Some(peer) => peer,
            None => {
                self.state
                    .write()
                    .remote_user_id
                    .get_or_insert_with(|| message.sender_id.clone());
                self.create_peer().await?
            }
        };
        peer.add_remote_candidate(payload.candidate).await?;
        Ok(())
    }

    async fn on_leave(&self, message: SignalingMessage) {
        let is_remote = self.state.read().remote_user_id.as_deref() == Some(message.sender_id.as_str());
        if !is_remote {
            return;
        }
        tracing::info!("Remote participant {} left", message.sender_id);

        self.teardown_peer().await;
        {
            let mut state = self.state.write();
            state.remote_user_id = None;
            state.remote_connection_id = None;
            state.reconnect_attempts = 0;
            state.remote_media = RemoteMediaState::default();
        }
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(SessionEvent::RemoteLeft {
            user_id: message.sender_id,
        });
    }

    // ========================================================================
    // PEER & CHANNEL EVENTS
    // ========================================================================

    async fn handle_peer_event(&self, event: PeerEvent) -> Result<(), CallError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if !self
                    .signaling
                    .send(MessageKind::IceCandidate, &CandidatePayload { candidate })
                {
                    tracing::debug!("Local candidate not sent, signaling is down");
                }
                Ok(())
            }
            PeerEvent::StateChanged(state) => self.on_peer_state(state).await,
            PeerEvent::RemoteStreamAvailable(stream) => {
                *self.remote.write() = Some(stream.clone());
                self.emit(SessionEvent::RemoteStreamChanged(Some(stream)));
                Ok(())
            }
            PeerEvent::RemoteStreamRemoved => {
                if self.remote.write().take().is_some() {
                    self.emit(SessionEvent::RemoteStreamChanged(None));
                }
                Ok(())
            }
        }
    }

    async fn on_peer_state(&self, peer_state: PeerConnectionState) -> Result<(), CallError> {
        let status = self.state.read().status;
        if status == ConnectionStatus::Failed {
            return Ok(());
        }

        match peer_state {
            PeerConnectionState::Connecting => {
                if status == ConnectionStatus::Disconnected {
                    self.set_status(ConnectionStatus::Connecting);
                }
            }
            PeerConnectionState::Connected => {
                {
                    let mut timers = self.timers.lock();
                    for timer in [timers.grace.take(), timers.attempt.take()].into_iter().flatten() {
                        timer.abort();
                    }
                }
                self.state.write().reconnect_attempts = 0;
                self.set_status(ConnectionStatus::Connected);
            }
            PeerConnectionState::Disconnected => self.start_grace_timer(),
            PeerConnectionState::Failed => {
                if let Some(grace) = self.timers.lock().grace.take() {
                    grace.abort();
                }
                self.recover().await?;
            }
            PeerConnectionState::New
            | PeerConnectionState::Gathering
            | PeerConnectionState::Closed => {}
        }
        Ok(())
    }

    async fn handle_channel_event(&self, event: ChannelEvent) -> Result<(), CallError> {
        match event {
            ChannelEvent::Reconnected => {
                tracing::info!("Signaling restored, announcing presence again");
                self.announce();
            }
            ChannelEvent::Disconnected { intentional: false } => {
                tracing::warn!("Signaling connection lost");
            }
            ChannelEvent::ReconnectFailed => {
                // Laufende Medien überleben den Relay-Ausfall
                if self.state.read().status != ConnectionStatus::Connected {
                    self.teardown_peer().await;
                    self.set_status(ConnectionStatus::Failed);
                }
                return Err(CallError::SignalingLost);
            }
            ChannelEvent::Connected
            | ChannelEvent::Disconnected { intentional: true }
            | ChannelEvent::Reconnecting { .. } => {}
        }
        Ok(())
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    /// ICE-Restart innerhalb des Versuchsbudgets
    async fn recover(&self) -> Result<(), CallError> {
        let Some(peer) = self.current_peer().filter(|p| !p.is_closed()) else {
            return Ok(());
        };

        let max_attempts = self.config.connection.max_reconnect_attempts;
        let attempt = {
            let mut state = self.state.write();
            if state.status == ConnectionStatus::Failed {
                return Ok(());
            }
            if state.reconnect_attempts >= max_attempts {
                None
            } else {
                state.reconnect_attempts += 1;
                Some(state.reconnect_attempts)
            }
        };
        let Some(attempt) = attempt else {
            return self.fail_call(max_attempts).await;
        };

        self.set_status(ConnectionStatus::Reconnecting);
        tracing::warn!(
            "Peer connection lost, recovery attempt {}/{}",
            attempt,
            max_attempts
        );

        match peer.restart_ice().await {
            Ok(offer) => {
                self.send_description(MessageKind::Offer, offer, &peer);
                self.arm_attempt_timer();
                Ok(())
            }
            Err(e) => {
                let delay = self
                    .config
                    .connection
                    .reconnect_policy()
                    .delay_for(attempt - 1)
                    .unwrap_or_else(|| self.config.connection.reconnect_policy().base_delay);
                tracing::warn!("ICE restart failed ({}), rebuilding in {:?}", e, delay);
                self.schedule_retry(delay);
                Ok(())
            }
        }
    }

    /// Kompletter Neuaufbau der Peer Connection
    async fn rebuild(&self) -> Result<(), CallError> {
        tracing::info!("Rebuilding peer connection");
        let Err(e) = self.start_negotiation().await else {
            self.arm_attempt_timer();
            return Ok(());
        };
        self.report(&e);

        let attempt = {
            let mut state = self.state.write();
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };
        match self
            .config
            .connection
            .reconnect_policy()
            .delay_for(attempt - 1)
        {
            Some(delay) => {
                self.schedule_retry(delay);
                Ok(())
            }
            None => {
                self.fail_call(self.config.connection.max_reconnect_attempts)
                    .await
            }
        }
    }

    /// Der letzte Versuch blieb unbeantwortet: nächster Neuaufbau oder Abbruch
    async fn on_attempt_timeout(&self) -> Result<(), CallError> {
        let max_attempts = self.config.connection.max_reconnect_attempts;
        let attempt = {
            let mut state = self.state.write();
            if state.reconnect_attempts >= max_attempts {
                None
            } else {
                state.reconnect_attempts += 1;
                Some(state.reconnect_attempts)
            }
        };
        let Some(attempt) = attempt else {
            return self.fail_call(max_attempts).await;
        };

        tracing::warn!(
            "No connection after {:?}, recovery attempt {}/{}",
            self.config.connection.connection_timeout(),
            attempt,
            max_attempts
        );
        self.rebuild().await
    }

    /// Terminal: bleibt `Failed` bis `retry()`
    async fn fail_call(&self, attempts: u32) -> Result<(), CallError> {
        tracing::error!("Giving up after {} recovery attempts", attempts);
        self.teardown_peer().await;
        self.set_status(ConnectionStatus::Failed);
        Err(CallError::CallFailed { attempts })
    }

    async fn reconnect_session(&self) -> Result<(), CallError> {
        if !self.signaling.is_connected() {
            let credentials = self.state.read().credentials.clone();
            self.signaling.connect(credentials).await?;
        }

        let has_remote = self.state.read().remote_user_id.is_some();
        if has_remote {
            self.set_status(ConnectionStatus::Connecting);
            self.start_negotiation().await
        } else {
            self.set_status(ConnectionStatus::Disconnected);
            self.announce();
            Ok(())
        }
    }

    fn start_grace_timer(&self) {
        let Some(tx) = self.input_tx.lock().clone() else {
            return;
        };
        let mut timers = self.timers.lock();
        if timers.grace.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let generation = self.peer_generation.load(Ordering::SeqCst);
        let grace = self.config.connection.disconnect_grace();
        tracing::debug!("Peer connection disconnected, waiting {:?}", grace);
        timers.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(SessionInput::DisconnectTimeout { generation });
        }));
    }

    fn schedule_retry(&self, delay: Duration) {
        let Some(tx) = self.input_tx.lock().clone() else {
            return;
        };
        let generation = self.peer_generation.load(Ordering::SeqCst);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionInput::RetryRecovery { generation });
        });
        if let Some(previous) = self.timers.lock().retry.replace(task) {
            previous.abort();
        }
    }

    /// Frist für den laufenden Recovery-Versuch
    fn arm_attempt_timer(&self) {
        let Some(tx) = self.input_tx.lock().clone() else {
            return;
        };
        let generation = self.peer_generation.load(Ordering::SeqCst);
        let timeout = self.config.connection.connection_timeout();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(SessionInput::AttemptTimeout { generation });
        });
        if let Some(previous) = self.timers.lock().attempt.replace(task) {
            previous.abort();
        }
    }

    fn cancel_timers(&self) {
        let mut timers = self.timers.lock();
        let pending = [timers.grace.take(), timers.retry.take(), timers.attempt.take()];
        for timer in pending.into_iter().flatten() {
            timer.abort();
        }
    }

    // ========================================================================
    // PEER CONNECTION
    // ========================================================================

    /// Neue Verbindung mit allen lokalen Tracks und Offer an die Gegenseite
    async fn start_negotiation(&self) -> Result<(), CallError> {
        let peer = self.create_peer().await?;
        let offer = peer.create_offer().await?;
        self.send_description(MessageKind::Offer, offer, &peer);
        Ok(())
    }

    /// Ersetzt die bestehende Verbindung; es gibt nie zwei gleichzeitig
    async fn create_peer(&self) -> Result<Arc<PeerConnectionManager>, CallError> {
        self.teardown_peer().await;

        let generation = self.peer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let input_tx = self.input_tx.lock().clone();
        let peer = PeerConnectionManager::new(&*self.peer_factory, &self.config, move |event| {
            if let Some(tx) = &input_tx {
                let _ = tx.send(SessionInput::Peer { generation, event });
            }
        })
        .await?;
        let peer = Arc::new(peer);

        // Während einer Freigabe geht der Bildschirm statt der Kamera raus
        let local = self.local_stream();
        let screen = self.share.screen_stream().and_then(|s| s.video_track());
        for track in local.map(|l| l.tracks()).unwrap_or_default() {
            let track = match (&screen, track.kind()) {
                (Some(screen), TrackKind::Video) => Arc::clone(screen),
                _ => track,
            };
            if let Err(e) = peer.add_track(track).await {
                peer.close().await;
                return Err(e.into());
            }
        }

        *self.peer.write() = Some(Arc::clone(&peer));
        Ok(peer)
    }

    async fn teardown_peer(&self) {
        {
            let mut timers = self.timers.lock();
            for timer in [timers.grace.take(), timers.attempt.take()].into_iter().flatten() {
                timer.abort();
            }
        }
        self.peer_generation.fetch_add(1, Ordering::SeqCst);

        let peer = self.peer.write().take();
        if let Some(peer) = peer {
            peer.close().await;
        }
        let remote = self.remote.write().take();
        if remote.is_some() {
            self.emit(SessionEvent::RemoteStreamChanged(None));
        }
    }

    fn send_description(
        &self,
        kind: MessageKind,
        description: SessionDescription,
        peer: &PeerConnectionManager,
    ) {
        let payload = DescriptionPayload {
            description,
            connection_id: Some(peer.connection_id().to_string()),
        };
        if !self.signaling.send(kind, &payload) {
            tracing::warn!("Could not send {}, signaling is down", kind);
        }
    }

    // ========================================================================
    // LOCAL MEDIA
    // ========================================================================

    fn toggle(&self, kind: TrackKind) -> Result<bool, CallError> {
        let local = self.local_stream().ok_or(CallError::NoSession)?;
        let enabled = !local.is_enabled(kind);
        local.set_enabled(kind, enabled);

        let (audio_enabled, video_enabled) = {
            let mut state = self.state.write();
            match kind {
                TrackKind::Audio => state.audio_enabled = enabled,
                TrackKind::Video => state.video_enabled = enabled,
            }
            (state.audio_enabled, state.video_enabled)
        };
        tracing::debug!("Local {:?} enabled: {}", kind, enabled);

        self.signaling.send(
            MessageKind::MediaStateChange,
            &MediaStatePayload {
                audio_enabled,
                video_enabled,
            },
        );
        self.emit(SessionEvent::LocalMediaChanged {
            audio_enabled,
            video_enabled,
        });
        Ok(enabled)
    }

    async fn switch_quality(&self, tier: QualityTier) -> Result<(), CallError> {
        let fresh = self.media.acquire_local_media(tier).await?;
        let (audio_enabled, video_enabled) = {
            let state = self.state.read();
            (state.audio_enabled, state.video_enabled)
        };
        fresh.set_enabled(TrackKind::Audio, audio_enabled);
        fresh.set_enabled(TrackKind::Video, video_enabled);

        if let Some(peer) = self.current_peer().filter(|p| !p.is_closed()) {
            let sharing = self.share.is_sharing();
            for track in fresh.tracks() {
                if sharing && track.kind() == TrackKind::Video {
                    continue;
                }
                if let Err(e) = peer.replace_track(track).await {
                    fresh.stop_all();
                    return Err(e.into());
                }
            }
        }

        if self.recorder.is_recording() {
            for track in fresh.tracks() {
                self.recorder.attach_track(&track);
            }
        }

        let previous = self.local.write().replace(fresh);
        if let Some(previous) = previous {
            previous.stop_all();
        }
        self.state.write().quality = tier;
        self.emit(SessionEvent::QualityChanged(tier));
        tracing::info!("Switched local media to {:?}", tier);
        Ok(())
    }

    async fn start_share(&self) -> Result<(), CallError> {
        let peer = self.current_peer().filter(|p| !p.is_closed());
        let track = self.share.start_screen_share(peer.as_deref()).await?;

        self.state.write().screen_sharing = true;
        self.signaling.send(
            MessageKind::ScreenShareStart,
            &ScreenSharePayload {
                track_id: Some(track.id().to_string()),
            },
        );
        self.emit(SessionEvent::ScreenShareChanged(true));
        Ok(())
    }

    async fn stop_share(&self) -> Result<(), CallError> {
        let peer = self.current_peer();
        let local = self.local_stream();
        let restore = self
            .share
            .stop_screen_share(peer.as_deref(), local.as_ref())
            .await;

        // Die Aufnahme ist auch bei Fehlern freigegeben
        let was_sharing = std::mem::replace(&mut self.state.write().screen_sharing, false);
        if was_sharing {
            self.signaling
                .send(MessageKind::ScreenShareStop, &ScreenSharePayload::default());
            self.emit(SessionEvent::ScreenShareChanged(false));
        }

        if let Some(CameraRestore::Reacquired(camera)) = restore? {
            camera.set_enabled(self.state.read().video_enabled);
            if self.recorder.is_recording() {
                self.recorder.attach_track(&camera);
            }
        }
        Ok(())
    }

    async fn finish_recording(&self) -> Result<(), CallError> {
        let result = self.recorder.stop_recording().await;
        let was_recording = std::mem::replace(&mut self.state.write().recording, false);
        if was_recording {
            self.emit(SessionEvent::RecordingChanged(false));
        }
        result.map_err(CallError::from)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn current_peer(&self) -> Option<Arc<PeerConnectionManager>> {
        self.peer.read().clone()
    }

    fn local_stream(&self) -> Option<MediaStreamHandle> {
        self.local.read().clone()
    }

    fn ensure_active(&self) -> Result<(), CallError> {
        if self.state.read().phase != SessionPhase::Active {
            return Err(CallError::NoSession);
        }
        Ok(())
    }

    /// Nachricht von jemand anderem als der bekannten Gegenseite
    fn is_foreign(&self, sender: &str) -> bool {
        matches!(&self.state.read().remote_user_id, Some(known) if known != sender)
    }

    fn announce(&self) {
        let sent = self.signaling.send(
            MessageKind::Join,
            &JoinPayload {
                user_id: self.local_user_id.clone(),
                display_name: None,
            },
        );
        if !sent {
            tracing::warn!("Could not announce presence, signaling is down");
        }
    }

    fn update_remote_media(&self, update: impl FnOnce(&mut RemoteMediaState)) {
        let media = {
            let mut state = self.state.write();
            update(&mut state.remote_media);
            state.remote_media
        };
        self.emit(SessionEvent::RemoteMediaChanged(media));
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut self.state.write().status, status);
        if previous != status {
            tracing::info!("Connection status {:?} -> {:?}", previous, status);
            self.emit(SessionEvent::ConnectionStatusChanged(status));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Meldet einen Fehler genau einmal an alle Beobachter
    fn report(&self, err: &CallError) {
        let report = err.report();
        tracing::error!("Call error ({:?}): {}", report.category, report.message);

        self.state.write().last_error = Some(report.clone());
        let callback = self.error_callback.read().clone();
        if let Some(callback) = callback {
            callback(&report);
        }
        self.emit(SessionEvent::Error(report));
    }

    fn reported<T>(&self, result: Result<T, CallError>) -> Result<T, CallError> {
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================
