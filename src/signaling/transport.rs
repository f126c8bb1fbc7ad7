//! Signaling Transport - Pull-Loop gegen das Relay
//!
//! Verwaltet die Kommunikation mit der Relay-API:
//! - Periodischer Abruf aller Signale für den lokalen Teilnehmer
//! - Zustellung in Server-Reihenfolge an einen Dispatch-Callback
//! - Best-Effort Versand (keine automatische Wiederholung)
//! - Degraded-Signal nach mehreren fehlgeschlagenen Abrufen

use super::messages::{PostSignalRequest, SignalPayload, SignalingEnvelope};
use super::relay::{RelayError, SignalingRelay};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Standard-Intervall zwischen zwei Abrufen
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Nach so vielen Fehlschlägen in Folge gilt die Verbindung als degradiert
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Signaling transport not started")]
    NotStarted,

    #[error("Signaling transport already running for meeting {0}")]
    AlreadyStarted(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events die vom SignalingTransport ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Zu viele Abrufe in Folge fehlgeschlagen
    Degraded { consecutive_failures: u32 },

    /// Erster erfolgreicher Abruf nach einer Degradierung
    Restored,
}

/// Empfänger für eingehende Envelopes
pub type DispatchFn = Arc<dyn Fn(SignalingEnvelope) + Send + Sync>;

// ============================================================================
// TRANSPORT STATE
// ============================================================================

#[derive(Debug, Clone)]
struct Route {
    meeting_id: String,
    local_id: String,
}

#[derive(Default)]
struct TransportState {
    route: Option<Route>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

// ============================================================================
// SIGNALING TRANSPORT
// ============================================================================

/// Pull-basierter Signaling Transport
pub struct SignalingTransport {
    relay: Arc<dyn SignalingRelay>,
    poll_interval: Duration,
    degraded_after: u32,
    state: Mutex<TransportState>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl SignalingTransport {
    /// Erstellt einen neuen Transport
    pub fn new(relay: Arc<dyn SignalingRelay>, poll_interval: Duration, degraded_after: u32) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            relay,
            poll_interval,
            degraded_after: degraded_after.max(1),
            state: Mutex::new(TransportState::default()),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob der Pull-Loop läuft
    pub fn is_running(&self) -> bool {
        self.state.lock().task.is_some()
    }

    /// Startet den Pull-Loop für `local_id` im Meeting `meeting_id`
    pub fn start(
        &self,
        meeting_id: &str,
        local_id: &str,
        dispatch: DispatchFn,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(route) = &state.route {
            return Err(TransportError::AlreadyStarted(route.meeting_id.clone()));
        }

        let route = Route {
            meeting_id: meeting_id.to_string(),
            local_id: local_id.to_string(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            meeting_id,
            local_id,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Starting signaling pull loop"
        );

        let task = tokio::spawn(pull_loop(
            Arc::clone(&self.relay),
            route.clone(),
            self.poll_interval,
            self.degraded_after,
            dispatch,
            self.event_tx.clone(),
            shutdown_rx,
        ));

        state.route = Some(route);
        state.shutdown = Some(shutdown_tx);
        state.task = Some(task);
        Ok(())
    }

    /// Sendet ein Signal an `to_id`.
    ///
    /// Fehler werden geloggt und zurückgegeben, aber nicht wiederholt.
    pub async fn send(&self, to_id: &str, signal: SignalPayload) -> Result<(), TransportError> {
        let route = self
            .state
            .lock()
            .route
            .clone()
            .ok_or(TransportError::NotStarted)?;

        let kind = signal.kind();
        let request = PostSignalRequest {
            meeting_id: route.meeting_id,
            from_user_id: route.local_id,
            to_user_id: to_id.to_string(),
            signal,
        };

        match self.relay.post_signal(&request).await {
            Ok(()) => {
                tracing::debug!(to = to_id, ?kind, "Signal posted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(to = to_id, ?kind, "Failed to post signal: {}", e);
                Err(e.into())
            }
        }
    }

    /// Stoppt Pull-Loop und Versand. Nach der Rückkehr wird nichts mehr dispatcht.
    pub fn stop(&self) {
        self.cancel_pull();
        self.state.lock().route = None;
    }

    /// Beendet nur den Pull-Loop; `send` bleibt bis `stop` möglich
    pub fn cancel_pull(&self) {
        let mut state = self.state.lock();
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = state.task.take() {
            task.abort();
            tracing::info!("Signaling pull loop stopped");
        }
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("poll_interval", &self.poll_interval)
            .field("route", &self.state.lock().route)
            .finish()
    }
}

// ============================================================================
// PULL LOOP
// ============================================================================

async fn pull_loop(
    relay: Arc<dyn SignalingRelay>,
    route: Route,
    poll_interval: Duration,
    degraded_after: u32,
    dispatch: DispatchFn,
    event_tx: broadcast::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;
    let mut degraded = false;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = relay.fetch_signals(&route.meeting_id, &route.local_id) => result,
        };

        let signals = match result {
            Ok(signals) => signals,
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!(
                    consecutive_failures,
                    "Failed to pull signals: {}",
                    e
                );
                if consecutive_failures >= degraded_after && !degraded {
                    degraded = true;
                    let _ = event_tx.send(TransportEvent::Degraded {
                        consecutive_failures,
                    });
                }
                continue;
            }
        };

        consecutive_failures = 0;
        if degraded {
            degraded = false;
            tracing::info!("Signaling connectivity restored");
            let _ = event_tx.send(TransportEvent::Restored);
        }

        let received_at = Utc::now();
        for signal in signals {
            if *shutdown.borrow() {
                return;
            }
            match signal.into_envelope(received_at) {
                Ok(envelope) if envelope.meeting_id != route.meeting_id => {
                    tracing::debug!(meeting_id = %envelope.meeting_id, "Dropping signal for other meeting");
                }
                Ok(envelope) if envelope.to != route.local_id => {
                    tracing::debug!(to = %envelope.to, "Dropping signal for other participant");
                }
                Ok(envelope) => dispatch(envelope),
                Err(e) => {
                    tracing::warn!("Skipping malformed signal: {}", e);
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::MemoryRelay;
    use crate::signaling::messages::RelaySignal;
    use serde_json::json;

    fn collecting_dispatch() -> (DispatchFn, Arc<Mutex<Vec<SignalingEnvelope>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let dispatch: DispatchFn = Arc::new(move |envelope| sink.lock().push(envelope));
        (dispatch, received)
    }

    fn raw_signal(from: &str, to: &str, signal: serde_json::Value) -> RelaySignal {
        RelaySignal {
            meeting_id: "m1".into(),
            from_user_id: from.into(),
            to_user_id: to.into(),
            signal,
            created_at: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_server_order() {
        let relay = Arc::new(MemoryRelay::new());
        relay.inject(raw_signal("bob", "alice", json!({ "type": "offer", "sdp": "o" })));
        relay.inject(raw_signal(
            "bob",
            "alice",
            json!({ "type": "ice-candidate", "candidate": { "candidate": "c1" } }),
        ));

        let transport = SignalingTransport::new(relay.clone(), DEFAULT_POLL_INTERVAL, 3);
        let (dispatch, received) = collecting_dispatch();
        transport.start("m1", "alice", dispatch).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let received = received.lock();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0].payload, SignalPayload::Offer { .. }));
        assert!(matches!(
            received[1].payload,
            SignalPayload::IceCandidate { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_malformed_signals() {
        let relay = Arc::new(MemoryRelay::new());
        relay.inject(raw_signal("bob", "alice", json!({ "type": "bogus" })));
        relay.inject(raw_signal("bob", "alice", json!({ "type": "answer", "sdp": "a" })));

        let transport = SignalingTransport::new(relay.clone(), DEFAULT_POLL_INTERVAL, 3);
        let (dispatch, received) = collecting_dispatch();
        transport.start("m1", "alice", dispatch).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind(), crate::signaling::SignalKind::Answer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_raise_one_degraded_event() {
        let relay = Arc::new(MemoryRelay::new());
        relay.fail_next_fetches(5);

        let transport = SignalingTransport::new(relay.clone(), DEFAULT_POLL_INTERVAL, 3);
        let mut events = transport.subscribe();
        let (dispatch, _) = collecting_dispatch();
        transport.start("m1", "alice", dispatch).unwrap();

        // Ticks bei 0s, 2s, 4s, 6s, 8s schlagen fehl, 10s klappt
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::Degraded {
                consecutive_failures: 3
            }
        );
        assert_eq!(events.try_recv().unwrap(), TransportEvent::Restored);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_dispatch() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay.clone(), DEFAULT_POLL_INTERVAL, 3);
        let (dispatch, received) = collecting_dispatch();
        transport.start("m1", "alice", dispatch).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        transport.stop();
        transport.stop();
        assert!(!transport.is_running());

        relay.inject(raw_signal("bob", "alice", json!({ "type": "offer", "sdp": "o" })));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(received.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pull_keeps_send() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay.clone(), DEFAULT_POLL_INTERVAL, 3);
        let (dispatch, received) = collecting_dispatch();
        transport.start("m1", "alice", dispatch).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        transport.cancel_pull();
        assert!(!transport.is_running());
        let fetches = relay.fetch_count();

        relay.inject(raw_signal("bob", "alice", json!({ "type": "offer", "sdp": "o" })));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(relay.fetch_count(), fetches);
        assert!(received.lock().is_empty());

        transport
            .send("bob", SignalPayload::Answer { sdp: "a".into() })
            .await
            .unwrap();
        assert_eq!(relay.posted().len(), 1);

        transport.stop();
        let result = transport
            .send("bob", SignalPayload::Answer { sdp: "b".into() })
            .await;
        assert!(matches!(result, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn test_send_requires_start() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay.clone(), DEFAULT_POLL_INTERVAL, 3);

        let result = transport
            .send("bob", SignalPayload::Offer { sdp: "o".into() })
            .await;
        assert!(matches!(result, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn test_send_failure_is_not_retried() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay.clone(), Duration::from_secs(60), 3);
        let (dispatch, _) = collecting_dispatch();
        transport.start("m1", "alice", dispatch).unwrap();
        relay.fail_next_posts(1);

        let result = transport
            .send("bob", SignalPayload::Offer { sdp: "o".into() })
            .await;
        assert!(matches!(result, Err(TransportError::Relay(_))));
        assert!(relay.posted().is_empty());

        transport
            .send("bob", SignalPayload::Answer { sdp: "a".into() })
            .await
            .unwrap();
        let posted = relay.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].from_user_id, "alice");
        assert_eq!(posted[0].meeting_id, "m1");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let relay = Arc::new(MemoryRelay::new());
        let transport = SignalingTransport::new(relay, Duration::from_secs(60), 3);
        let (dispatch, _) = collecting_dispatch();
        transport.start("m1", "alice", dispatch.clone()).unwrap();

        assert!(matches!(
            transport.start("m1", "alice", dispatch),
            Err(TransportError::AlreadyStarted(_))
        ));
    }
}
