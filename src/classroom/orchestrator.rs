//! Connection Orchestrator
//!
//! Verbindet Transport, Capture und Registry zu einem Meeting:
//! - `join` startet Capture und den Pull-Loop
//! - `connect_to` öffnet Sessions zu neuen Teilnehmern
//! - `leave` baut alles in fester Reihenfolge wieder ab

use super::observer::{ClassroomObserver, Connectivity};
use crate::config::{CapturePolicy, ClassroomConfig, ConfigError};
use crate::media::{CaptureError, CaptureSource, DeviceCaptureSource, LocalMedia, MediaCaptureManager};
use crate::peer::{
    NegotiationState, PeerConnector, PeerEvent, PeerRegistry, RegistryError, Role, RtcConnector,
    SessionContext, StreamHandle,
};
use crate::signaling::{
    DispatchFn, HttpRelay, RelayError, SignalingRelay, SignalingTransport, TransportError,
    TransportEvent,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ClassroomError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Signaling error: {0}")]
    Transport(#[from] TransportError),

    #[error("Local media unavailable: {0}")]
    CaptureUnavailable(#[source] CaptureError),

    #[error("Already joined meeting {0}")]
    AlreadyJoined(String),

    #[error("Not joined to a meeting")]
    NotJoined,

    #[error("Join was cancelled by leave")]
    JoinCancelled,

    #[error("Invalid meeting or participant id")]
    InvalidId,
}

// ============================================================================
// MEETING SESSION
// ============================================================================

/// Alles was zu einem beigetretenen Meeting gehört
struct MeetingSession {
    meeting_id: String,
    local_id: String,
    transport: Arc<SignalingTransport>,
    registry: Arc<PeerRegistry>,
    pumps: Vec<JoinHandle<()>>,
}

impl MeetingSession {
    fn abort_pumps(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl Drop for MeetingSession {
    fn drop(&mut self) {
        self.registry.seal();
        self.transport.stop();
        self.abort_pumps();
    }
}

// ============================================================================
// CONNECTION ORCHESTRATOR
// ============================================================================

pub struct ConnectionOrchestrator {
    config: ClassroomConfig,
    relay: Arc<dyn SignalingRelay>,
    connector: Arc<dyn PeerConnector>,
    capture: Arc<MediaCaptureManager>,
    observer: Arc<dyn ClassroomObserver>,
    meeting: Mutex<Option<MeetingSession>>,

    /// Wird von `leave` erhöht; ein laufendes `join` bricht dann ab
    epoch: AtomicU64,
}

impl ConnectionOrchestrator {
    /// Orchestrator mit HTTP Relay, WebRTC und Standard-Mikrofon
    pub fn new(
        config: ClassroomConfig,
        observer: Arc<dyn ClassroomObserver>,
    ) -> Result<Self, ClassroomError> {
        let relay = HttpRelay::new(config.relay_url()?, config.bearer_token.clone())?;
        let connector = RtcConnector::new(&config.ice_servers);
        let capture = DeviceCaptureSource::new(config.capture_video);

        Ok(Self::with_parts(
            config,
            Arc::new(relay),
            Arc::new(connector),
            Arc::new(capture),
            observer,
        ))
    }

    /// Orchestrator mit eigenen Relay-, Connector- und Capture-Implementierungen
    pub fn with_parts(
        config: ClassroomConfig,
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn PeerConnector>,
        capture_source: Arc<dyn CaptureSource>,
        observer: Arc<dyn ClassroomObserver>,
    ) -> Self {
        Self {
            config,
            relay,
            connector,
            capture: Arc::new(MediaCaptureManager::new(capture_source)),
            observer,
            meeting: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Tritt einem Meeting bei: Capture, Registry und Pull-Loop
    pub async fn join(&self, meeting_id: &str, local_id: &str) -> Result<(), ClassroomError> {
        if meeting_id.is_empty() || local_id.is_empty() {
            return Err(ClassroomError::InvalidId);
        }
        if let Some(joined) = self.meeting_id() {
            return Err(ClassroomError::AlreadyJoined(joined));
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        tracing::info!(meeting_id, local_id, "Joining meeting");

        let local_media = match self.capture.acquire().await {
            Ok(media) => Some(media),
            Err(e) if self.config.capture_policy == CapturePolicy::ReceiveOnly => {
                tracing::warn!("Joining receive-only, capture unavailable: {}", e);
                None
            }
            Err(e) => {
                tracing::error!("Capture unavailable: {}", e);
                return Err(ClassroomError::CaptureUnavailable(e));
            }
        };

        let transport = Arc::new(SignalingTransport::new(
            Arc::clone(&self.relay),
            self.config.poll_interval,
            self.config.degraded_after,
        ));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerRegistry::new(SessionContext {
            local_id: local_id.to_string(),
            connector: Arc::clone(&self.connector),
            transport: Arc::clone(&transport),
            local_media,
            negotiation_timeout: self.config.negotiation_timeout,
            events: peer_tx,
            runtime: tokio::runtime::Handle::current(),
        }));

        let pumps = vec![
            tokio::spawn(peer_pump(
                peer_rx,
                Arc::clone(&registry),
                Arc::clone(&self.observer),
            )),
            tokio::spawn(health_pump(transport.subscribe(), Arc::clone(&self.observer))),
        ];
        let meeting = MeetingSession {
            meeting_id: meeting_id.to_string(),
            local_id: local_id.to_string(),
            transport: Arc::clone(&transport),
            registry: Arc::clone(&registry),
            pumps,
        };

        let mut slot = self.meeting.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            drop(slot);
            drop(meeting);
            self.capture.release();
            tracing::info!(meeting_id, "Join cancelled by leave");
            return Err(ClassroomError::JoinCancelled);
        }
        if let Some(existing) = slot.as_ref() {
            return Err(ClassroomError::AlreadyJoined(existing.meeting_id.clone()));
        }

        let dispatch_registry = Arc::clone(&registry);
        let dispatch: DispatchFn = Arc::new(move |envelope| {
            dispatch_registry.dispatch(envelope);
        });
        transport.start(meeting_id, local_id, dispatch)?;

        *slot = Some(meeting);
        tracing::info!(meeting_id, local_id, "Joined meeting");
        Ok(())
    }

    /// Öffnet Sessions zu allen noch unbekannten Teilnehmern.
    ///
    /// Gibt die IDs zurück, für die ein Offer gestartet wurde.
    pub fn connect_to<I, S>(&self, participant_ids: I) -> Result<Vec<String>, ClassroomError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = self
            .meeting
            .lock()
            .as_ref()
            .map(|m| Arc::clone(&m.registry))
            .ok_or(ClassroomError::NotJoined)?;

        let mut started = Vec::new();
        for id in participant_ids {
            let id = id.as_ref();
            if id.is_empty() || id == registry.local_id() {
                continue;
            }
            // Auch eine bestehende Session in Idle (z.B. nur durch Candidates
            // entstanden) bekommt ein Offer
            match registry.ensure_session(id, Role::Initiator) {
                Ok((session, _)) => {
                    if session.start_offer() {
                        started.push(id.to_string());
                    }
                }
                Err(RegistryError::Sealed) => break,
                Err(e) => tracing::warn!(remote_id = id, "Cannot connect: {}", e),
            }
        }

        if !started.is_empty() {
            tracing::info!(peers = ?started, "Connecting to participants");
        }
        Ok(started)
    }

    /// Verlässt das Meeting: Pull-Loop, Sessions, Capture, Transport.
    ///
    /// Mehrfacher Aufruf und Aufruf vor oder während `join` sind erlaubt.
    pub async fn leave(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let meeting = self.meeting.lock().take();

        match meeting {
            Some(mut meeting) => {
                tracing::info!(meeting_id = %meeting.meeting_id, local_id = %meeting.local_id, "Leaving meeting");
                meeting.registry.seal();
                meeting.transport.cancel_pull();
                meeting.registry.close_all().await;
                self.capture.release();
                meeting.transport.stop();
                meeting.abort_pumps();
                tracing::info!(meeting_id = %meeting.meeting_id, "Left meeting");
            }
            None => self.capture.release(),
        }
    }

    /// Das lokale Capture-Handle für die Vorschau
    pub fn local_media(&self) -> Option<Arc<LocalMedia>> {
        self.capture.current()
    }

    pub fn is_joined(&self) -> bool {
        self.meeting.lock().is_some()
    }

    pub fn meeting_id(&self) -> Option<String> {
        self.meeting.lock().as_ref().map(|m| m.meeting_id.clone())
    }

    /// Sortierte IDs aller Teilnehmer mit aktiver Session
    pub fn peers(&self) -> Vec<String> {
        self.registry().map(|r| r.all()).unwrap_or_default()
    }

    pub fn peer_state(&self, remote_id: &str) -> Option<NegotiationState> {
        self.registry().and_then(|r| r.state_of(remote_id))
    }

    pub fn remote_stream(&self, remote_id: &str) -> Option<StreamHandle> {
        self.registry().and_then(|r| r.remote_stream(remote_id))
    }

    fn registry(&self) -> Option<Arc<PeerRegistry>> {
        self.meeting.lock().as_ref().map(|m| Arc::clone(&m.registry))
    }
}

impl std::fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOrchestrator")
            .field("meeting_id", &self.meeting_id())
            .field("peers", &self.peers())
            .finish()
    }
}

// ============================================================================
// EVENT PUMPS
// ============================================================================

/// Leitet Session-Events an den Observer weiter
async fn peer_pump(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    registry: Arc<PeerRegistry>,
    observer: Arc<dyn ClassroomObserver>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::RemoteStream {
                remote_id,
                serial,
                stream,
            } => {
                if registry.is_current(&remote_id, serial) {
                    observer.on_remote_stream(&remote_id, stream);
                }
            }
            PeerEvent::Lost {
                remote_id,
                serial,
                reason,
            } => {
                if registry.is_sealed() {
                    continue;
                }
                tracing::warn!(remote_id = %remote_id, "Peer lost: {}", reason);
                registry.remove_if(&remote_id, serial).await;
                observer.on_peer_lost(&remote_id);
            }
        }
    }
}

/// Meldet Degraded/Restored des Transports an den Observer
async fn health_pump(
    mut events: broadcast::Receiver<TransportEvent>,
    observer: Arc<dyn ClassroomObserver>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Degraded {
                consecutive_failures,
            }) => {
                tracing::warn!(consecutive_failures, "Signaling connectivity degraded");
                observer.on_connectivity_changed(Connectivity::Degraded {
                    consecutive_failures,
                });
            }
            Ok(TransportEvent::Restored) => {
                observer.on_connectivity_changed(Connectivity::Healthy);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Health events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
