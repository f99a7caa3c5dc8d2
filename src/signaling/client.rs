//! Signaling-Client mit Publish/Subscribe pro Nachrichtenart
//!
//! Verwaltet die Verbindung zum Relay einer Sitzung:
//! - Handler pro `MessageKind`, Aufruf in Registrierungs-Reihenfolge
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Lifecycle-Events über einen Broadcast-Kanal

use super::messages::{MessageKind, SignalingMessage};
use super::transport::{Connection, Connector, Credentials, TransportError, TransportFrame};
use crate::config::{ConnectionConfig, ReconnectPolicy};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("No credentials supplied for the signaling relay")]
    Authentication,

    #[error("Signaling transport failed: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// CHANNEL EVENTS
// ============================================================================

/// Lifecycle-Events des Kanals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,

    /// Verbindung weg; `intentional` bei lokalem `disconnect()` oder regulärem Close
    Disconnected { intentional: bool },

    /// Nächster Versuch startet nach `delay`
    Reconnecting { attempt: u32, delay: Duration },

    Reconnected,

    /// Versuchsbudget erschöpft, es wird nicht weiter versucht
    ReconnectFailed,
}

/// Handle einer Registrierung, nötig für `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type MessageHandler = Arc<dyn Fn(&SignalingMessage) + Send + Sync>;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Default)]
struct ClientState {
    connected: bool,
    /// Zählt Verbindungen hoch, damit ein alter Reader kein Close mehr meldet
    generation: u64,
    room_id: Option<String>,
    outbound: Option<mpsc::Sender<String>>,
}

struct ClientInner {
    url: Url,
    local_user_id: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connection_timeout: Duration,
    credentials: Mutex<Option<Credentials>>,
    state: RwLock<ClientState>,
    handlers: RwLock<HashMap<MessageKind, Vec<(SubscriptionId, MessageHandler)>>>,
    next_subscription: AtomicU64,
    event_tx: broadcast::Sender<ChannelEvent>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Sitzungsgebundener Client für den Signaling-Relay
///
/// Klone teilen sich Verbindung, Handler und Event-Kanal.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    pub fn new(
        url: Url,
        local_user_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        connection: &ConnectionConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(ClientInner {
                url,
                local_user_id: local_user_id.into(),
                connector,
                policy: connection.reconnect_policy(),
                connection_timeout: connection.connection_timeout(),
                credentials: Mutex::new(None),
                state: RwLock::new(ClientState::default()),
                handlers: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                event_tx,
                reader_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.local_user_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    /// Setzt den Raum für ausgehende Envelopes und den Eingangsfilter
    pub fn set_room(&self, room_id: Option<String>) {
        self.inner.state.write().room_id = room_id;
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.state.read().room_id.clone()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Verbindet mit dem Relay
    ///
    /// Ein laufender Reconnect-Timer wird vorher abgebrochen, eine bestehende
    /// Verbindung ersetzt.
    pub async fn connect(&self, credentials: Option<Credentials>) -> Result<(), SignalingError> {
        let credentials = credentials
            .filter(|c| !c.token.is_empty())
            .ok_or(SignalingError::Authentication)?;

        self.inner.cancel_reconnect();
        self.inner.close_current();
        *self.inner.credentials.lock() = Some(credentials);

        let connection = self.inner.establish().await?;
        self.inner.install(connection);

        tracing::info!(
            "Connected to signaling relay as {}",
            self.inner.local_user_id
        );
        let _ = self.inner.event_tx.send(ChannelEvent::Connected);
        Ok(())
    }

    /// Trennt absichtlich; es folgt kein Reconnect
    pub fn disconnect(&self) {
        self.inner.cancel_reconnect();
        if self.inner.close_current() {
            tracing::info!("Disconnected from signaling relay");
            let _ = self
                .inner
                .event_tx
                .send(ChannelEvent::Disconnected { intentional: true });
        }
    }

    /// Fire-and-forget Publish
    ///
    /// `true` heißt nur, dass der Transport beim Aufruf offen war.
    pub fn send<P: Serialize>(&self, kind: MessageKind, payload: &P) -> bool {
        let (tx, room_id) = {
            let state = self.inner.state.read();
            match &state.outbound {
                Some(tx) => (tx.clone(), state.room_id.clone().unwrap_or_default()),
                None => {
                    tracing::debug!("Dropping {} message: channel not open", kind);
                    return false;
                }
            }
        };

        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Failed to serialize {} payload: {}", kind, e);
                return false;
            }
        };
        let message = SignalingMessage::new(kind, room_id, &self.inner.local_user_id, payload);
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize {} message: {}", kind, e);
                return false;
            }
        };

        match tx.try_send(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to queue {} message: {}", kind, e);
                false
            }
        }
    }

    /// Registriert einen Handler; mehrere pro Art sind erlaubt
    pub fn subscribe(
        &self,
        kind: MessageKind,
        handler: impl Fn(&SignalingMessage) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Entfernt einen Handler; unbekannte IDs werden ignoriert
    pub fn unsubscribe(&self, kind: MessageKind, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    /// Entfernt alle Handler (Sitzungsende)
    pub fn clear_subscriptions(&self) {
        self.inner.handlers.write().clear();
    }
}

impl ClientInner {
    async fn establish(&self) -> Result<Connection, SignalingError> {
        let credentials = self
            .credentials
            .lock()
            .clone()
            .ok_or(SignalingError::Authentication)?;

        match tokio::time::timeout(
            self.connection_timeout,
            self.connector.connect(&self.url, &credentials),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout(self.connection_timeout).into()),
        }
    }

    fn install(self: &Arc<Self>, connection: Connection) {
        let Connection {
            outbound,
            mut inbound,
        } = connection;

        let generation = {
            let mut state = self.state.write();
            state.generation += 1;
            state.connected = true;
            state.outbound = Some(outbound);
            state.generation
        };

        // Read-Task: Frames in Empfangsreihenfolge dispatchen
        let inner = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let mut intentional = false;
            while let Some(frame) = inbound.recv().await {
                match frame {
                    TransportFrame::Text(text) => inner.dispatch_raw(&text),
                    TransportFrame::Closed { intentional: closed } => {
                        intentional = closed;
                        break;
                    }
                }
            }
            inner.handle_close(generation, intentional);
        });

        if let Some(old) = self.reader_task.lock().replace(reader) {
            old.abort();
        }
    }

    /// Schließt die aktuelle Verbindung lokal, ohne Events
    fn close_current(&self) -> bool {
        let was_connected = {
            let mut state = self.state.write();
            state.generation += 1;
            state.outbound = None;
            std::mem::replace(&mut state.connected, false)
        };
        if let Some(reader) = self.reader_task.lock().take() {
            reader.abort();
        }
        was_connected
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, intentional: bool) {
        {
            let mut state = self.state.write();
            if state.generation != generation {
                return;
            }
            state.connected = false;
            state.outbound = None;
        }

        if intentional {
            tracing::info!("Signaling relay closed the channel");
        } else {
            tracing::warn!("Signaling channel dropped unexpectedly");
        }
        let _ = self.event_tx.send(ChannelEvent::Disconnected { intentional });

        if !intentional {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.reconnect_loop().await });
        if let Some(old) = self.reconnect_task.lock().replace(task) {
            old.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 0;
        loop {
            let Some(delay) = self.policy.delay_for(attempt) else {
                tracing::error!("Giving up on signaling relay after {} attempts", attempt);
                let _ = self.event_tx.send(ChannelEvent::ReconnectFailed);
                return;
            };
            attempt += 1;

            tracing::info!(
                "Reconnecting to signaling relay in {:?} (attempt {}/{})",
                delay,
                attempt,
                self.policy.max_attempts
            );
            let _ = self
                .event_tx
                .send(ChannelEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            match self.establish().await {
                Ok(connection) => {
                    self.install(connection);
                    tracing::info!("Reconnected to signaling relay");
                    let _ = self.event_tx.send(ChannelEvent::Reconnected);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }
    }

    fn dispatch_raw(&self, text: &str) {
        match serde_json::from_str::<SignalingMessage>(text) {
            Ok(message) => self.dispatch(&message),
            Err(e) => tracing::warn!("Ignoring malformed signaling message: {}", e),
        }
    }

    fn dispatch(&self, message: &SignalingMessage) {
        if message.sender_id == self.local_user_id {
            return;
        }
        if let Some(room_id) = &self.state.read().room_id {
            if &message.room_id != room_id {
                tracing::debug!(
                    "Ignoring {} for room {} (joined {})",
                    message.kind,
                    message.room_id,
                    room_id
                );
                return;
            }
        }

        // Liste klonen, damit Handler selbst (un)subscriben dürfen
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .get(&message.kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(message);
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("SignalingClient")
            .field("url", &self.inner.url.as_str())
            .field("local_user_id", &self.inner.local_user_id)
            .field("room_id", &state.room_id)
            .field("connected", &state.connected)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
