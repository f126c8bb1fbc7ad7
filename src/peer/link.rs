//! Abstraktion über die zugrundeliegende Peer Connection
//!
//! Die Session-Zustandsmaschine spricht nur mit [`PeerLink`]; die
//! WebRTC-Implementierung steckt in `rtc.rs`.

use crate::media::LocalMedia;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum LinkError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection closed")]
    Closed,
}

// ============================================================================
// LINK TYPES
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Verbindungsstatus wie von der Peer Connection gemeldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Unknown,
        }
    }
}

/// Verweis auf einen eingehenden Remote-Stream.
///
/// Hält nur eine schwache Referenz; die Lebensdauer des Tracks gehört
/// der Peer Connection.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream_id: String,
    pub track_id: String,
    pub kind: TrackKind,
    track: Weak<TrackRemote>,
}

impl StreamHandle {
    pub fn new(stream_id: impl Into<String>, track_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            stream_id: stream_id.into(),
            track_id: track_id.into(),
            kind,
            track: Weak::new(),
        }
    }

    pub fn from_remote(track: &Arc<TrackRemote>) -> Self {
        Self {
            stream_id: track.stream_id(),
            track_id: track.id(),
            kind: track.kind().into(),
            track: Arc::downgrade(track),
        }
    }

    /// Der Track, solange die Peer Connection ihn noch hält
    pub fn track(&self) -> Option<Arc<TrackRemote>> {
        self.track.upgrade()
    }
}

/// Events die von einem PeerLink ausgelöst werden
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Lokaler ICE Candidate, muss an den Peer gesendet werden
    LocalCandidate(IceCandidate),

    /// Remote Track ist angekommen
    RemoteTrack(StreamHandle),

    StateChanged(LinkState),
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

// ============================================================================
// TRAITS
// ============================================================================

/// Eine einzelne Peer Connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Erstellt ein Offer, setzt es als Local Description und gibt das SDP zurück
    async fn create_offer(&self) -> Result<String, LinkError>;

    /// Erstellt ein Answer, setzt es als Local Description und gibt das SDP zurück
    async fn create_answer(&self) -> Result<String, LinkError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), LinkError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Löst lokale Tracks und schließt die Verbindung
    async fn close(&self);
}

/// Erstellt Peer Connections für einzelne Teilnehmer
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        remote_id: &str,
        local_media: Option<Arc<LocalMedia>>,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, LinkError>;
}
