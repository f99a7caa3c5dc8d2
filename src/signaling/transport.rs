//! Transport-Schicht unter dem Signaling-Client
//!
//! Ein `Connector` öffnet eine Verbindung zum Relay und liefert zwei Kanäle:
//! ausgehende JSON-Texte und eingehende Frames. Das Standard-Backend ist
//! WebSocket (tokio-tungstenite).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
}

/// Zugangsdaten für das Relay
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Eingehende Frame vom Transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    /// Verbindung beendet; `intentional` bei regulärem Close durch die Gegenseite
    Closed { intentional: bool },
}

/// Offene Verbindung
///
/// Droppen von `outbound` schließt die Verbindung lokal.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url, credentials: &Credentials)
        -> Result<Connection, TransportError>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// WebSocket-Verbindung mit Keep-Alive Pings
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    heartbeat_interval: Duration,
}

impl WebSocketConnector {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &Url,
        credentials: &Credentials,
    ) -> Result<Connection, TransportError> {
        let mut ws_url = url.clone();
        ws_url
            .query_pairs_mut()
            .append_pair("token", &credentials.token);

        tracing::info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);
        let (in_tx, in_rx) = mpsc::channel::<TransportFrame>(100);

        // Read-Task
        tokio::spawn(async move {
            let mut intentional = false;
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(TransportFrame::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        intentional = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        tracing::info!("WebSocket closed by relay (intentional: {})", intentional);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            let _ = in_tx.send(TransportFrame::Closed { intentional }).await;
        });

        // Write-Task mit Heartbeat; Relays trennen inaktive Sockets
        let heartbeat_interval = self.heartbeat_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval_at(
                tokio::time::Instant::now() + heartbeat_interval,
                heartbeat_interval,
            );
            loop {
                tokio::select! {
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else {
                            // Sender gedroppt: lokales Disconnect
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "client disconnect".into(),
                                })))
                                .await;
                            break;
                        };
                        if let Err(e) = write.send(Message::Text(msg)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            tracing::warn!("Failed to send heartbeat: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
