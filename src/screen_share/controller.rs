//! Track Substitution Controller
//!
//! Tauscht den ausgehenden Video-Track zwischen Kamera und Bildschirm, ohne
//! die Verbindung neu zu verhandeln. Endet die Bildschirmaufnahme von außen
//! (OS-Dialog "Freigabe beenden"), meldet der Watcher `EndedExternally`;
//! der Besitzer der Verbindung ruft daraufhin `stop_screen_share` auf.

use crate::media::{MediaManager, MediaStreamHandle, MediaTrack, PermissionError};
use crate::peer::{PeerConnectionManager, PeerError};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone)]
pub enum ShareError {
    #[error("Screen share is already active")]
    AlreadySharing,

    #[error("Screen capture returned no video track")]
    NoVideoTrack,

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEvent {
    Started { track_id: String },
    /// Die Quelle hat die Aufnahme beendet; `generation` identifiziert die Freigabe
    EndedExternally { generation: u64 },
    Stopped,
}

/// Welcher Kamera-Track nach dem Teilen wieder gesendet wird
#[derive(Debug, Clone)]
pub enum CameraRestore {
    Reused(Arc<MediaTrack>),
    Reacquired(Arc<MediaTrack>),
}

impl CameraRestore {
    pub fn track(&self) -> &Arc<MediaTrack> {
        match self {
            CameraRestore::Reused(track) | CameraRestore::Reacquired(track) => track,
        }
    }
}

#[derive(Default)]
struct ShareState {
    screen: Option<MediaStreamHandle>,
    watcher: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct ScreenShareController {
    media: Arc<MediaManager>,
    state: Mutex<ShareState>,
    event_tx: broadcast::Sender<ShareEvent>,
}

impl ScreenShareController {
    pub fn new(media: Arc<MediaManager>) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            media,
            state: Mutex::new(ShareState::default()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_sharing(&self) -> bool {
        self.state.lock().screen.is_some()
    }

    pub fn screen_stream(&self) -> Option<MediaStreamHandle> {
        self.state.lock().screen.clone()
    }

    /// Aktuelle Freigabe-Nummer, um veraltete `EndedExternally` zu erkennen
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Startet die Bildschirmfreigabe
    ///
    /// Ohne Peer Connection wird nur die Aufnahme geöffnet; der Track geht
    /// dann mit der nächsten Verbindung raus.
    pub async fn start_screen_share(
        &self,
        peer: Option<&PeerConnectionManager>,
    ) -> Result<Arc<MediaTrack>, ShareError> {
        if self.is_sharing() {
            return Err(ShareError::AlreadySharing);
        }

        let screen = self.media.acquire_screen_capture().await?;
        let Some(track) = screen.video_track() else {
            screen.stop_all();
            return Err(ShareError::NoVideoTrack);
        };

        if let Some(peer) = peer {
            if let Err(e) = peer.replace_track(Arc::clone(&track)).await {
                screen.stop_all();
                return Err(e.into());
            }
        }

        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;

        let watched = Arc::clone(&track);
        let event_tx = self.event_tx.clone();
        state.watcher = Some(tokio::spawn(async move {
            watched.ended().await;
            tracing::info!("Screen capture ended by the system");
            let _ = event_tx.send(ShareEvent::EndedExternally { generation });
        }));
        state.screen = Some(screen);
        drop(state);

        tracing::info!("Screen share started (track {})", track.id());
        let _ = self.event_tx.send(ShareEvent::Started {
            track_id: track.id().to_string(),
        });
        Ok(track)
    }

    /// Beendet die Freigabe und setzt die Kamera wieder ein
    ///
    /// Ohne aktive Freigabe ein No-op (`Ok(None)`). Die Bildschirmaufnahme ist
    /// auch dann freigegeben, wenn die Kamera nicht zurückkommt.
    pub async fn stop_screen_share(
        &self,
        peer: Option<&PeerConnectionManager>,
        local: Option<&MediaStreamHandle>,
    ) -> Result<Option<CameraRestore>, ShareError> {
        let screen = {
            let mut state = self.state.lock();
            let Some(screen) = state.screen.take() else {
                return Ok(None);
            };
            if let Some(watcher) = state.watcher.take() {
                watcher.abort();
            }
            screen
        };
        screen.stop_all();
        let _ = self.event_tx.send(ShareEvent::Stopped);
        tracing::info!("Screen share stopped");

        let restore = match local.and_then(|l| l.video_track()).filter(|t| t.is_live()) {
            Some(camera) => CameraRestore::Reused(camera),
            None => {
                let camera = self.media.acquire_camera_video().await?;
                if let Some(local) = local {
                    if let Some(old) = local.replace_track(Arc::clone(&camera)) {
                        old.stop();
                    }
                }
                CameraRestore::Reacquired(camera)
            }
        };

        if let Some(peer) = peer.filter(|p| !p.is_closed()) {
            peer.replace_track(Arc::clone(restore.track())).await?;
        }
        Ok(Some(restore))
    }

    /// Gibt die Aufnahme ohne Kamera-Rückkehr frei (Sitzungsende)
    pub fn release(&self) {
        let screen = {
            let mut state = self.state.lock();
            if let Some(watcher) = state.watcher.take() {
                watcher.abort();
            }
            state.screen.take()
        };
        if let Some(screen) = screen {
            screen.stop_all();
            let _ = self.event_tx.send(ShareEvent::Stopped);
        }
    }
}

impl std::fmt::Debug for ScreenShareController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenShareController")
            .field("is_sharing", &self.is_sharing())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
