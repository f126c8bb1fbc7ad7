//! Signaling Module - Pull-basierter Client für die Relay-API
//!
//! Dieses Modul verwaltet die Kommunikation über das externe Relay:
//! - Signale (Offer, Answer, ICE Candidate) typsicher kodieren
//! - Envelopes an einzelne Teilnehmer senden
//! - Eingehende Envelopes periodisch abholen und weiterleiten
//!

mod memory;
mod messages;
mod relay;
mod transport;

pub use memory::MemoryRelay;
pub use messages::*;
pub use relay::{HttpRelay, RelayError, SignalingRelay};
pub use transport::{
    DispatchFn, SignalingTransport, TransportError, TransportEvent, DEFAULT_DEGRADED_AFTER,
    DEFAULT_POLL_INTERVAL,
};
