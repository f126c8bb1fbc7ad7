//! Classroom RTC - Signaling und Verbindungsmanagement für Live-Klassenräume
//!
//! Eine Peer Connection pro Teilnehmer, Signaling über ein HTTP Relay:
//! - Pull-basierter Signaling Transport (Offer, Answer, ICE Candidates)
//! - WebRTC Peer Sessions mit Glare-Auflösung
//! - Ein geteiltes lokales Capture-Handle pro Meeting
//! - Observer-Callbacks für Remote-Streams und verlorene Peers

pub mod classroom;
pub mod config;
pub mod media;
pub mod peer;
pub mod signaling;

#[cfg(test)]
pub(crate) mod test_support;

pub use classroom::{ClassroomError, ClassroomObserver, Connectivity, ConnectionOrchestrator};
pub use config::{CapturePolicy, ClassroomConfig, IceServerConfig};
pub use media::{LocalMedia, MediaCaptureManager};
pub use peer::{NegotiationState, PeerRegistry, PeerSession, Role, StreamHandle};
pub use signaling::{SignalingEnvelope, SignalingTransport};

/// Installiert den `tracing` Subscriber.
///
/// Ohne `RUST_LOG` gilt `classroom_rtc=debug,webrtc=warn`. Ein zweiter
/// Aufruf ist wirkungslos.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("classroom_rtc=debug,webrtc=warn"));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging initialized");
    }
}
