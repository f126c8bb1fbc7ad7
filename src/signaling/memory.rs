//! In-Process Relay
//!
//! Verhält sich wie die Relay-API, hält die Signale aber im Speicher.
//! Mehrere Orchestratoren im selben Prozess können sich ein Relay teilen;
//! außerdem lassen sich Fehler und Duplikate gezielt einspeisen.

use super::messages::{PostSignalRequest, RelaySignal};
use super::relay::{RelayError, SignalingRelay};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct MemoryRelayState {
    /// (meeting_id, user_id) → wartende Signale
    queues: HashMap<(String, String), Vec<RelaySignal>>,
    posted: Vec<PostSignalRequest>,
    failing_fetches: u32,
    failing_posts: u32,
    fetch_count: u64,
}

/// Relay im Speicher, u.a. für Tests und lokale Demos
#[derive(Debug, Default)]
pub struct MemoryRelay {
    state: Mutex<MemoryRelayState>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Legt ein Signal direkt in die Queue des Empfängers
    pub fn inject(&self, signal: RelaySignal) {
        let key = (signal.meeting_id.clone(), signal.to_user_id.clone());
        self.state.lock().queues.entry(key).or_default().push(signal);
    }

    /// Alle bisher geposteten Signale in Sendereihenfolge
    pub fn posted(&self) -> Vec<PostSignalRequest> {
        self.state.lock().posted.clone()
    }

    /// Anzahl der Abrufe (auch fehlgeschlagener)
    pub fn fetch_count(&self) -> u64 {
        self.state.lock().fetch_count
    }

    /// Die nächsten `count` Abrufe schlagen fehl
    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().failing_fetches = count;
    }

    /// Die nächsten `count` Posts schlagen fehl
    pub fn fail_next_posts(&self, count: u32) {
        self.state.lock().failing_posts = count;
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn post_signal(&self, request: &PostSignalRequest) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.failing_posts > 0 {
            state.failing_posts -= 1;
            return Err(RelayError::Unavailable("injected post failure".into()));
        }
        state.posted.push(request.clone());
        let key = (request.meeting_id.clone(), request.to_user_id.clone());
        state
            .queues
            .entry(key)
            .or_default()
            .push(RelaySignal::from_request(request, Utc::now()));
        Ok(())
    }

    async fn fetch_signals(
        &self,
        meeting_id: &str,
        user_id: &str,
    ) -> Result<Vec<RelaySignal>, RelayError> {
        let mut state = self.state.lock();
        state.fetch_count += 1;
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(RelayError::Unavailable("injected fetch failure".into()));
        }
        let key = (meeting_id.to_string(), user_id.to_string());
        Ok(state.queues.remove(&key).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::SignalPayload;

    fn offer(from: &str, to: &str) -> PostSignalRequest {
        PostSignalRequest {
            meeting_id: "m1".into(),
            from_user_id: from.into(),
            to_user_id: to.into(),
            signal: SignalPayload::Offer { sdp: "v=0".into() },
        }
    }

    #[tokio::test]
    async fn test_post_routes_to_recipient_queue() {
        let relay = MemoryRelay::new();
        relay.post_signal(&offer("alice", "bob")).await.unwrap();

        assert!(relay.fetch_signals("m1", "alice").await.unwrap().is_empty());
        let signals = relay.fetch_signals("m1", "bob").await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].from_user_id, "alice");

        // Queue ist nach dem Abruf leer
        assert!(relay.fetch_signals("m1", "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let relay = MemoryRelay::new();
        relay.fail_next_fetches(2);
        relay.fail_next_posts(1);

        assert!(relay.fetch_signals("m1", "bob").await.is_err());
        assert!(relay.fetch_signals("m1", "bob").await.is_err());
        assert!(relay.fetch_signals("m1", "bob").await.is_ok());
        assert!(relay.post_signal(&offer("alice", "bob")).await.is_err());
        assert!(relay.post_signal(&offer("alice", "bob")).await.is_ok());
        assert_eq!(relay.posted().len(), 1);
        assert_eq!(relay.fetch_count(), 3);
    }
}
