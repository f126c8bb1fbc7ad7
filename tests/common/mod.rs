//! Gemeinsame Fakes für die Integrationstests

#![allow(dead_code)]

use async_trait::async_trait;
use classroom_rtc::media::{CaptureError, CaptureSource, LocalMedia};
use classroom_rtc::peer::{
    LinkError, LinkEvent, LinkEventSender, LinkState, PeerConnector, PeerLink, SdpKind,
    StreamHandle, TrackKind,
};
use classroom_rtc::signaling::IceCandidate;
use classroom_rtc::{ClassroomObserver, Connectivity};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Peer Connection ohne Netzwerk: eine gesetzte Remote Description
/// liefert sofort einen Remote Track und "connected".
pub struct LoopbackLink {
    local_id: String,
    remote_id: String,
    events: LinkEventSender,
    remote_descriptions: AtomicUsize,
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String, LinkError> {
        let _ = self
            .events
            .send(LinkEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{}",
                self.local_id
            ))));
        Ok(format!("offer {} -> {}", self.local_id, self.remote_id))
    }

    async fn create_answer(&self) -> Result<String, LinkError> {
        Ok(format!("answer {} -> {}", self.local_id, self.remote_id))
    }

    async fn set_remote_description(&self, _kind: SdpKind, _sdp: String) -> Result<(), LinkError> {
        self.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::RemoteTrack(StreamHandle::new(
            format!("stream-{}", self.remote_id),
            "audio",
            TrackKind::Audio,
        )));
        let _ = self.events.send(LinkEvent::StateChanged(LinkState::Connected));
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), LinkError> {
        Ok(())
    }

    async fn close(&self) {}
}

pub struct LoopbackConnector {
    local_id: String,
    connects: AtomicUsize,
}

impl LoopbackConnector {
    pub fn new(local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_string(),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        remote_id: &str,
        _local_media: Option<Arc<LocalMedia>>,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackLink {
            local_id: self.local_id.clone(),
            remote_id: remote_id.to_string(),
            events,
            remote_descriptions: AtomicUsize::new(0),
        }))
    }
}

pub struct NoDeviceCapture;

impl CaptureSource for NoDeviceCapture {
    fn open(&self) -> Result<LocalMedia, CaptureError> {
        Ok(LocalMedia::new(false, None))
    }
}

#[derive(Default)]
pub struct Recorder {
    streams: Mutex<Vec<String>>,
    lost: Mutex<Vec<String>>,
    connectivity: Mutex<Vec<Connectivity>>,
}

impl Recorder {
    pub fn streams(&self) -> Vec<String> {
        self.streams.lock().unwrap().clone()
    }

    pub fn lost(&self) -> Vec<String> {
        self.lost.lock().unwrap().clone()
    }
}

impl ClassroomObserver for Recorder {
    fn on_remote_stream(&self, remote_id: &str, _stream: StreamHandle) {
        self.streams.lock().unwrap().push(remote_id.to_string());
    }

    fn on_peer_lost(&self, remote_id: &str) {
        self.lost.lock().unwrap().push(remote_id.to_string());
    }

    fn on_connectivity_changed(&self, connectivity: Connectivity) {
        self.connectivity.lock().unwrap().push(connectivity);
    }
}
