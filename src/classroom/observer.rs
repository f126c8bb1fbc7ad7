//! Observer-Schnittstelle zur einbettenden UI

use crate::peer::StreamHandle;

/// Zustand der Signaling-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Healthy,
    Degraded { consecutive_failures: u32 },
}

/// Wird einmal bei der Konstruktion registriert.
///
/// Die Methoden laufen auf einem Tokio-Task und sollten nicht blockieren.
pub trait ClassroomObserver: Send + Sync {
    /// Remote-Stream eines Teilnehmers ist da (einmal pro Negotiation)
    fn on_remote_stream(&self, remote_id: &str, stream: StreamHandle);

    /// Verbindung zu einem Teilnehmer ist verloren (nicht bei `leave`)
    fn on_peer_lost(&self, remote_id: &str);

    fn on_connectivity_changed(&self, _connectivity: Connectivity) {}
}
