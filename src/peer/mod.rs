//! Peer Module - Eine Verbindung pro Remote-Teilnehmer
//!
//! Dieses Modul verwaltet:
//! - Die Negotiation State Machine pro Teilnehmer
//! - Das Registry aller Sessions eines Meetings
//! - WebRTC Peer Connections hinter dem `PeerLink` Trait

pub mod link;
mod registry;
mod rtc;
mod session;

pub use link::{
    LinkError, LinkEvent, LinkEventSender, LinkState, PeerConnector, PeerLink, SdpKind,
    StreamHandle, TrackKind,
};
pub use registry::{DispatchOutcome, PeerRegistry, RegistryError};
pub use rtc::{RtcConnector, RtcPeerLink};
pub use session::{NegotiationState, PeerEvent, PeerSession, Role};
pub(crate) use session::SessionContext;
