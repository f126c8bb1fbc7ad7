//! Peer Session - Negotiation State Machine
//!
//! Jede Session läuft als eigener Task mit eigener Inbox. Ein Schritt der
//! auf die Peer Connection wartet blockiert damit nie andere Sessions.
//! `close()` bricht laufende Schritte ab und räumt die Verbindung auf.
//!
//! Initiator:  Idle → OfferSent → AnswerPending → Connected → Closed
//! Responder:  Idle → OfferReceived → AnswerSent → Connected → Closed
//! Failed ist von jedem nicht geschlossenen Zustand aus erreichbar.

use super::link::{LinkEvent, LinkState, PeerConnector, PeerLink, SdpKind, StreamHandle};
use crate::media::LocalMedia;
use crate::signaling::{IceCandidate, SignalPayload, SignalingEnvelope, SignalingTransport};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// SESSION TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerPending,
    OfferReceived,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// Wartet auf ein Answer für das eigene Offer
    pub fn awaits_answer(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent | NegotiationState::AnswerPending
        )
    }
}

/// Events die von Sessions an den Orchestrator gehen
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Remote-Stream der aktuellen Negotiation ist da (einmal pro Zyklus)
    RemoteStream {
        remote_id: String,
        serial: u64,
        stream: StreamHandle,
    },

    /// Session ist fehlgeschlagen
    Lost {
        remote_id: String,
        serial: u64,
        reason: String,
    },
}

/// Gemeinsame Abhängigkeiten aller Sessions eines Meetings
pub(crate) struct SessionContext {
    pub local_id: String,
    pub connector: Arc<dyn PeerConnector>,
    pub transport: Arc<SignalingTransport>,
    pub local_media: Option<Arc<LocalMedia>>,
    pub negotiation_timeout: Option<Duration>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub runtime: tokio::runtime::Handle,
}

enum Command {
    StartOffer,
    Deliver(SignalingEnvelope),
}

// ============================================================================
// PEER SESSION
// ============================================================================

/// Handle auf eine laufende Session
pub struct PeerSession {
    remote_id: String,
    serial: u64,
    role: Arc<RwLock<Role>>,
    remote_stream: Arc<Mutex<Option<StreamHandle>>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<NegotiationState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    offer_requested: AtomicBool,
}

impl PeerSession {
    pub(crate) fn spawn(
        remote_id: &str,
        serial: u64,
        role: Role,
        context: Arc<SessionContext>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let role = Arc::new(RwLock::new(role));
        let remote_stream = Arc::new(Mutex::new(None));

        let driver = SessionDriver {
            remote_id: remote_id.to_string(),
            serial,
            role: Arc::clone(&role),
            remote_stream: Arc::clone(&remote_stream),
            state: state_tx,
            context: Arc::clone(&context),
            link: None,
            link_events: None,
            seen: HashSet::new(),
            pending_candidates: VecDeque::new(),
            remote_description_applied: false,
            stream_announced: false,
            deadline: None,
        };

        let task = context.runtime.spawn(driver.run(command_rx, shutdown_rx));

        Self {
            remote_id: remote_id.to_string(),
            serial,
            role,
            remote_stream,
            commands: command_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            offer_requested: AtomicBool::new(false),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Vom Registry vergebene laufende Nummer
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    pub fn remote_stream(&self) -> Option<StreamHandle> {
        self.remote_stream.lock().clone()
    }

    /// Startet die Negotiation als Initiator (nur aus `Idle`).
    ///
    /// Gibt `false` zurück, wenn schon ein Offer angefordert wurde oder die
    /// Negotiation bereits läuft.
    pub fn start_offer(&self) -> bool {
        if self.state() != NegotiationState::Idle
            || self.offer_requested.swap(true, Ordering::SeqCst)
        {
            return false;
        }
        self.commands.send(Command::StartOffer).is_ok()
    }

    /// Übergibt ein eingehendes Envelope an die Session
    pub fn deliver(&self, envelope: SignalingEnvelope) -> bool {
        self.commands.send(Command::Deliver(envelope)).is_ok()
    }

    /// Schließt die Session. Mehrfacher Aufruf ist erlaubt.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(remote_id = %self.remote_id, "Session task ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote_id", &self.remote_id)
            .field("serial", &self.serial)
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// SESSION DRIVER
// ============================================================================

enum Step {
    Command(Command),
    Link(Option<LinkEvent>),
    Timeout,
}

struct SessionDriver {
    remote_id: String,
    serial: u64,
    role: Arc<RwLock<Role>>,
    remote_stream: Arc<Mutex<Option<StreamHandle>>>,
    state: watch::Sender<NegotiationState>,
    context: Arc<SessionContext>,

    link: Option<Arc<dyn PeerLink>>,

    /// Events des aktuellen Links; ein neuer Link bekommt einen neuen Channel
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,

    /// Fingerprints bereits verarbeiteter Envelopes
    seen: HashSet<u64>,

    pending_candidates: VecDeque<IceCandidate>,
    remote_description_applied: bool,
    stream_announced: bool,
    deadline: Option<Instant>,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                event = next_link_event(&mut self.link_events) => Step::Link(event),
                _ = sleep_until(self.deadline) => Step::Timeout,
            };

            // Ein laufender Schritt wird bei close() abgebrochen
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.handle(step) => {}
            }

            if self.current().is_terminal() {
                break;
            }
        }

        self.teardown().await;
    }

    async fn handle(&mut self, step: Step) {
        match step {
            Step::Command(Command::StartOffer) => self.start_offer().await,
            Step::Command(Command::Deliver(envelope)) => self.receive(envelope).await,
            Step::Link(Some(event)) => self.on_link_event(event).await,
            Step::Link(None) => self.link_events = None,
            Step::Timeout => self.on_timeout(),
        }
    }

    fn current(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn set_state(&self, state: NegotiationState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(remote_id = %self.remote_id, "Negotiation state: {:?} -> {:?}", previous, state);
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = self
            .context
            .negotiation_timeout
            .map(|timeout| Instant::now() + timeout);
    }

    // ========================================================================
    // INITIATOR
    // ========================================================================

    async fn start_offer(&mut self) {
        if self.current() != NegotiationState::Idle {
            tracing::debug!(remote_id = %self.remote_id, state = ?self.current(), "Offer already in progress");
            return;
        }
        *self.role.write() = Role::Initiator;

        let link = match self.ensure_link().await {
            Ok(link) => link,
            Err(e) => return self.fail(format!("failed to create peer connection: {}", e)),
        };
        let sdp = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => return self.fail(format!("failed to create offer: {}", e)),
        };

        self.set_state(NegotiationState::OfferSent);
        self.arm_deadline();
        tracing::info!(remote_id = %self.remote_id, "Sending offer");

        // Schlägt der Versand fehl, bleibt die Session in OfferSent
        if self.send(SignalPayload::Offer { sdp }).await {
            self.set_state(NegotiationState::AnswerPending);
        }
    }

    async fn receive_answer(&mut self, sdp: String) {
        if !self.current().awaits_answer() {
            tracing::debug!(remote_id = %self.remote_id, state = ?self.current(), "Dropping unexpected answer");
            return;
        }
        let Some(link) = self.link.clone() else {
            return self.fail("answer without peer connection".to_string());
        };

        if let Err(e) = link.set_remote_description(SdpKind::Answer, sdp).await {
            return self.fail(format!("failed to apply answer: {}", e));
        }
        self.remote_description_applied = true;
        self.flush_candidates(&link).await;
        self.mark_connected();
    }

    // ========================================================================
    // RESPONDER
    // ========================================================================

    async fn receive_offer(&mut self, sdp: String) {
        match self.current() {
            NegotiationState::Idle => {}
            state if state.awaits_answer() => {
                if self.context.local_id < self.remote_id {
                    tracing::info!(remote_id = %self.remote_id, "Glare: keeping own offer");
                    return;
                }
                tracing::info!(remote_id = %self.remote_id, "Glare: yielding to remote offer");
                self.reset_link().await;
            }
            NegotiationState::Failed | NegotiationState::Closed => return,
            _ => {
                tracing::info!(remote_id = %self.remote_id, "Remote restarted negotiation");
                self.reset_link().await;
            }
        }
        self.answer_offer(sdp).await;
    }

    async fn answer_offer(&mut self, sdp: String) {
        *self.role.write() = Role::Responder;
        self.stream_announced = false;
        self.set_state(NegotiationState::OfferReceived);
        self.arm_deadline();

        let link = match self.ensure_link().await {
            Ok(link) => link,
            Err(e) => return self.fail(format!("failed to create peer connection: {}", e)),
        };
        if let Err(e) = link.set_remote_description(SdpKind::Offer, sdp).await {
            return self.fail(format!("failed to apply offer: {}", e));
        }
        self.remote_description_applied = true;
        self.flush_candidates(&link).await;

        let answer = match link.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return self.fail(format!("failed to create answer: {}", e)),
        };

        tracing::info!(remote_id = %self.remote_id, "Sending answer");
        self.send(SignalPayload::Answer { sdp: answer }).await;
        self.set_state(NegotiationState::AnswerSent);
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    async fn receive_candidate(&mut self, candidate: IceCandidate) {
        match (&self.link, self.remote_description_applied) {
            (Some(link), true) => {
                let link = Arc::clone(link);
                self.apply_candidate(&link, candidate).await;
            }
            _ => {
                tracing::debug!(remote_id = %self.remote_id, "Queueing early candidate");
                self.pending_candidates.push_back(candidate);
                // Eine nur durch Candidates entstandene Session läuft sonst nie ab
                if self.current() == NegotiationState::Idle && self.deadline.is_none() {
                    self.arm_deadline();
                }
            }
        }
    }

    async fn flush_candidates(&mut self, link: &Arc<dyn PeerLink>) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(link, candidate).await;
        }
    }

    /// Abgelehnte Candidates (z.B. Duplikate) beenden die Session nicht
    async fn apply_candidate(&self, link: &Arc<dyn PeerLink>, candidate: IceCandidate) {
        if let Err(e) = link.add_ice_candidate(candidate).await {
            tracing::debug!(remote_id = %self.remote_id, "Ignoring rejected candidate: {}", e);
        }
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    async fn receive(&mut self, envelope: SignalingEnvelope) {
        if self.current().is_terminal() {
            return;
        }
        if !self.seen.insert(envelope.payload.fingerprint()) {
            tracing::debug!(remote_id = %self.remote_id, kind = ?envelope.kind(), "Dropping duplicate envelope");
            return;
        }

        match envelope.payload {
            SignalPayload::Offer { sdp } => self.receive_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.receive_answer(sdp).await,
            SignalPayload::IceCandidate { candidate } => self.receive_candidate(candidate).await,
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.send(SignalPayload::IceCandidate { candidate }).await;
            }
            LinkEvent::RemoteTrack(stream) => {
                tracing::info!(remote_id = %self.remote_id, stream_id = %stream.stream_id, "Remote track arrived");
                {
                    let mut slot = self.remote_stream.lock();
                    if slot.is_none() {
                        *slot = Some(stream);
                    }
                }
                match self.current() {
                    NegotiationState::AnswerSent | NegotiationState::Connected => {
                        self.mark_connected()
                    }
                    _ => {}
                }
            }
            LinkEvent::StateChanged(LinkState::Connected) => {
                if self.current() == NegotiationState::AnswerSent {
                    self.mark_connected();
                }
            }
            LinkEvent::StateChanged(state @ (LinkState::Disconnected | LinkState::Failed | LinkState::Closed)) => {
                self.fail(format!("peer connection {:?}", state).to_lowercase());
            }
            LinkEvent::StateChanged(_) => {}
        }
    }

    fn on_timeout(&mut self) {
        self.deadline = None;
        if self.current() != NegotiationState::Connected {
            self.fail("negotiation timed out".to_string());
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn mark_connected(&mut self) {
        if self.current() != NegotiationState::Connected {
            tracing::info!(remote_id = %self.remote_id, "Peer connected");
            self.set_state(NegotiationState::Connected);
        }
        self.deadline = None;

        if self.stream_announced {
            return;
        }
        let stream = self.remote_stream.lock().clone();
        if let Some(stream) = stream {
            self.stream_announced = true;
            let _ = self.context.events.send(PeerEvent::RemoteStream {
                remote_id: self.remote_id.clone(),
                serial: self.serial,
                stream,
            });
        }
    }

    fn fail(&mut self, reason: String) {
        if self.current().is_terminal() {
            return;
        }
        tracing::error!(remote_id = %self.remote_id, "Peer session failed: {}", reason);
        self.set_state(NegotiationState::Failed);
        self.deadline = None;
        let _ = self.context.events.send(PeerEvent::Lost {
            remote_id: self.remote_id.clone(),
            serial: self.serial,
            reason,
        });
    }

    async fn send(&self, signal: SignalPayload) -> bool {
        self.context
            .transport
            .send(&self.remote_id, signal)
            .await
            .is_ok()
    }

    async fn ensure_link(&mut self) -> Result<Arc<dyn PeerLink>, super::link::LinkError> {
        if let Some(link) = &self.link {
            return Ok(Arc::clone(link));
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = self
            .context
            .connector
            .connect(&self.remote_id, self.context.local_media.clone(), event_tx)
            .await?;
        self.link = Some(Arc::clone(&link));
        self.link_events = Some(event_rx);
        Ok(link)
    }

    /// Verwirft die aktuelle Peer Connection samt ihrer Events
    async fn reset_link(&mut self) {
        self.link_events = None;
        self.remote_description_applied = false;
        *self.remote_stream.lock() = None;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    async fn teardown(&mut self) {
        self.deadline = None;
        self.link_events = None;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.pending_candidates.clear();
        if self.current() != NegotiationState::Failed {
            self.set_state(NegotiationState::Closed);
        }
        tracing::debug!(remote_id = %self.remote_id, serial = self.serial, "Peer session closed");
    }
}

async fn next_link_event(events: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// TESTS
// ============================================================================
