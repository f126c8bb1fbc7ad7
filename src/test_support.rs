//! Test-Hilfen: Fake Peer Connections, Observer und Session-Kontext

use crate::classroom::{ClassroomObserver, Connectivity};
use crate::media::{CaptureError, CaptureSource, LocalMedia};
use crate::peer::link::{
    LinkError, LinkEvent, LinkEventSender, LinkState, PeerConnector, PeerLink, SdpKind,
    StreamHandle, TrackKind,
};
use crate::peer::{PeerEvent, SessionContext};
use crate::signaling::{DispatchFn, IceCandidate, MemoryRelay, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wartet bis `condition` erfüllt ist (max. 5s)
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// FAKE LINK
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Clone, Copy, Default)]
struct FakeBehavior {
    reject_candidates: bool,
    fail_remote_description: bool,
    stall_offers: bool,
    silent_remote: bool,
    slow_close: bool,
}

pub struct FakeLink {
    remote_id: String,
    events: LinkEventSender,
    behavior: FakeBehavior,
    ops: Mutex<Vec<LinkOp>>,
    candidates: Mutex<Vec<IceCandidate>>,
    rejected: AtomicUsize,
    closed: AtomicBool,
    sequence: usize,
}

impl FakeLink {
    pub fn ops(&self) -> Vec<LinkOp> {
        self.ops.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn remote_description_count(&self) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, LinkOp::SetRemote(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simuliert ein Event der Peer Connection
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn local_candidate(&self, label: &str) {
        self.emit(LinkEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{}-{}-{}",
            self.remote_id, self.sequence, label
        ))));
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<String, LinkError> {
        self.ops.lock().push(LinkOp::CreateOffer);
        if self.behavior.stall_offers {
            std::future::pending::<()>().await;
        }
        self.local_candidate("offer");
        Ok(format!("offer-sdp-{}-{}", self.remote_id, self.sequence))
    }

    async fn create_answer(&self) -> Result<String, LinkError> {
        self.ops.lock().push(LinkOp::CreateAnswer);
        self.local_candidate("answer");
        Ok(format!("answer-sdp-{}-{}", self.remote_id, self.sequence))
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: String) -> Result<(), LinkError> {
        self.ops.lock().push(LinkOp::SetRemote(kind));
        if self.behavior.fail_remote_description {
            return Err(LinkError::InvalidSdp("rejected by fake".into()));
        }
        if self.behavior.silent_remote {
            return Ok(());
        }
        self.emit(LinkEvent::RemoteTrack(StreamHandle::new(
            format!("stream-{}", self.remote_id),
            "audio",
            TrackKind::Audio,
        )));
        self.emit(LinkEvent::RemoteTrack(StreamHandle::new(
            format!("stream-{}", self.remote_id),
            "video",
            TrackKind::Video,
        )));
        self.emit(LinkEvent::StateChanged(LinkState::Connected));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.ops
            .lock()
            .push(LinkOp::AddCandidate(candidate.candidate.clone()));
        if self.behavior.reject_candidates {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(LinkError::InvalidCandidate("rejected by fake".into()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        if self.behavior.slow_close {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.ops.lock().push(LinkOp::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// FAKE CONNECTOR
// ============================================================================

#[derive(Clone, Default)]
pub struct FakeConnector {
    links: Arc<Mutex<Vec<Arc<FakeLink>>>>,
    behavior: FakeBehavior,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_candidates(mut self) -> Self {
        self.behavior.reject_candidates = true;
        self
    }

    pub fn failing_remote_description(mut self) -> Self {
        self.behavior.fail_remote_description = true;
        self
    }

    pub fn stalling_offers(mut self) -> Self {
        self.behavior.stall_offers = true;
        self
    }

    /// Remote Description wird gesetzt, aber weder Track noch "connected" folgen
    pub fn silent_after_remote_description(mut self) -> Self {
        self.behavior.silent_remote = true;
        self
    }

    pub fn closing_slowly(mut self) -> Self {
        self.behavior.slow_close = true;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Alle Links zu `remote_id` in Erstellungsreihenfolge
    pub fn links(&self, remote_id: &str) -> Vec<Arc<FakeLink>> {
        self.links
            .lock()
            .iter()
            .filter(|l| l.remote_id == remote_id)
            .cloned()
            .collect()
    }

    /// Der neueste Link zu `remote_id`
    pub fn link(&self, remote_id: &str) -> Option<Arc<FakeLink>> {
        self.links(remote_id).pop()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        remote_id: &str,
        _local_media: Option<Arc<LocalMedia>>,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let mut links = self.links.lock();
        let link = Arc::new(FakeLink {
            remote_id: remote_id.to_string(),
            events,
            behavior: self.behavior,
            ops: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            sequence: links.len(),
        });
        links.push(Arc::clone(&link));
        Ok(link)
    }
}

// ============================================================================
// SESSION CONTEXT
// ============================================================================

/// Relay, gestarteter Transport und Event-Channel für Session-Tests
pub struct TestContext {
    pub relay: Arc<MemoryRelay>,
    pub transport: Arc<SignalingTransport>,
    local_id: String,
    connector: FakeConnector,
    timeout: Option<Duration>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerEvent>>,
    received: Mutex<Vec<PeerEvent>>,
}

impl TestContext {
    pub fn new(local_id: &str, connector: FakeConnector) -> Self {
        let relay = Arc::new(MemoryRelay::new());
        let transport = Arc::new(SignalingTransport::new(
            relay.clone(),
            Duration::from_secs(60),
            3,
        ));
        let dispatch: DispatchFn = Arc::new(|_| {});
        transport
            .start("m1", local_id, dispatch)
            .expect("transport starts");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            relay,
            transport,
            local_id: local_id.to_string(),
            connector,
            timeout: None,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session_context(&self) -> Arc<SessionContext> {
        Arc::new(self.context())
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            local_id: self.local_id.clone(),
            connector: Arc::new(self.connector.clone()),
            transport: Arc::clone(&self.transport),
            local_media: None,
            negotiation_timeout: self.timeout,
            events: self.events_tx.clone(),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Wartet auf das nächste RemoteStream Event
    pub async fn next_stream(&self) -> (String, StreamHandle) {
        let mut rx = self.events_rx.lock().await;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("peer event in time")
                .expect("event channel open");
            self.received.lock().push(event.clone());
            if let PeerEvent::RemoteStream {
                remote_id, stream, ..
            } = event
            {
                return (remote_id, stream);
            }
        }
    }

    /// Wartet kurz und gibt alle bisher empfangenen Events zurück
    async fn settled_events(&self) -> Vec<PeerEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut rx = self.events_rx.lock().await;
        let mut received = self.received.lock();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        received.clone()
    }

    pub async fn stream_count(&self) -> usize {
        self.settled_events()
            .await
            .iter()
            .filter(|e| matches!(e, PeerEvent::RemoteStream { .. }))
            .count()
    }

    pub async fn lost(&self) -> Vec<(String, u64)> {
        self.settled_events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                PeerEvent::Lost {
                    remote_id, serial, ..
                } => Some((remote_id, serial)),
                _ => None,
            })
            .collect()
    }

    pub async fn lost_count(&self) -> usize {
        self.lost().await.len()
    }
}

// ============================================================================
// CAPTURE / OBSERVER
// ============================================================================

/// Capture ohne Geräte; optional immer fehlschlagend
pub struct StaticCapture {
    pub fail: bool,
    pub opens: AtomicUsize,
}

impl StaticCapture {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            opens: AtomicUsize::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            opens: AtomicUsize::new(0),
        })
    }
}

impl CaptureSource for StaticCapture {
    fn open(&self) -> Result<LocalMedia, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CaptureError::NoInputDevice);
        }
        Ok(LocalMedia::new(true, None))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Stream(String),
    Lost(String),
    Connectivity(Connectivity),
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().clone()
    }

    pub fn count(&self, expected: &Observed) -> usize {
        self.events.lock().iter().filter(|e| *e == expected).count()
    }
}

impl ClassroomObserver for RecordingObserver {
    fn on_remote_stream(&self, remote_id: &str, _stream: StreamHandle) {
        self.events.lock().push(Observed::Stream(remote_id.to_string()));
    }

    fn on_peer_lost(&self, remote_id: &str) {
        self.events.lock().push(Observed::Lost(remote_id.to_string()));
    }

    fn on_connectivity_changed(&self, connectivity: Connectivity) {
        self.events
            .lock()
            .push(Observed::Connectivity(connectivity));
    }
}
