//! Peer Registry
//!
//! Hält höchstens eine Session pro Remote-Teilnehmer. Anlegen und
//! Zustellen passieren unter demselben Lock, daher kann ein eingehendes
//! Offer und ein lokales `connect_to` nie zwei Sessions erzeugen.

use super::session::{NegotiationState, PeerSession, Role, SessionContext};
use super::link::StreamHandle;
use crate::signaling::{SignalKind, SignalingEnvelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry is sealed")]
    Sealed,

    #[error("Cannot open a session to the local participant")]
    SelfTarget,

    #[error("Invalid participant id")]
    InvalidId,
}

/// Ergebnis von [`PeerRegistry::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An eine bestehende Session übergeben
    Routed,

    /// Neue Responder-Session angelegt
    Spawned,

    Ignored,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Arc<PeerSession>>,
    next_serial: u64,
    sealed: bool,
}

pub struct PeerRegistry {
    context: Arc<SessionContext>,
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub(crate) fn new(context: SessionContext) -> Self {
        Self {
            context: Arc::new(context),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.context.local_id
    }

    /// Gibt die bestehende Session zurück oder legt eine neue an.
    ///
    /// Der zweite Wert ist `true`, wenn die Session neu ist. Eine bereits
    /// gescheiterte Session wird dabei ersetzt.
    pub fn ensure_session(
        &self,
        remote_id: &str,
        role: Role,
    ) -> Result<(Arc<PeerSession>, bool), RegistryError> {
        let mut inner = self.inner.lock();
        self.ensure_locked(&mut inner, remote_id, role)
    }

    fn ensure_locked(
        &self,
        inner: &mut RegistryInner,
        remote_id: &str,
        role: Role,
    ) -> Result<(Arc<PeerSession>, bool), RegistryError> {
        if inner.sealed {
            return Err(RegistryError::Sealed);
        }
        if remote_id.is_empty() {
            return Err(RegistryError::InvalidId);
        }
        if remote_id == self.context.local_id {
            return Err(RegistryError::SelfTarget);
        }

        if let Some(existing) = inner.sessions.get(remote_id) {
            if !existing.state().is_terminal() {
                return Ok((Arc::clone(existing), false));
            }
        }

        inner.next_serial += 1;
        let session = Arc::new(PeerSession::spawn(
            remote_id,
            inner.next_serial,
            role,
            Arc::clone(&self.context),
        ));
        tracing::debug!(remote_id, serial = inner.next_serial, ?role, "Created peer session");

        if let Some(stale) = inner
            .sessions
            .insert(remote_id.to_string(), Arc::clone(&session))
        {
            self.context.runtime.spawn(async move { stale.close().await });
        }
        Ok((session, true))
    }

    /// Leitet ein eingehendes Envelope an die passende Session weiter
    pub fn dispatch(&self, envelope: SignalingEnvelope) -> DispatchOutcome {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return DispatchOutcome::Ignored;
        }
        if envelope.to != self.context.local_id || envelope.from == self.context.local_id {
            tracing::debug!(from = %envelope.from, to = %envelope.to, "Ignoring misaddressed envelope");
            return DispatchOutcome::Ignored;
        }

        let known = inner
            .sessions
            .get(&envelope.from)
            .filter(|s| !s.state().is_terminal())
            .cloned();
        if let Some(session) = known {
            session.deliver(envelope);
            return DispatchOutcome::Routed;
        }

        if envelope.kind() == SignalKind::Answer {
            tracing::debug!(from = %envelope.from, "Dropping answer from unknown peer");
            return DispatchOutcome::Ignored;
        }

        match self.ensure_locked(&mut inner, &envelope.from, Role::Responder) {
            Ok((session, _)) => {
                tracing::info!(from = %envelope.from, kind = ?envelope.kind(), "New peer from inbound signal");
                session.deliver(envelope);
                DispatchOutcome::Spawned
            }
            Err(e) => {
                tracing::debug!(from = %envelope.from, "Dropping envelope: {}", e);
                DispatchOutcome::Ignored
            }
        }
    }

    /// Schließt und entfernt die Session zu `remote_id`
    pub async fn remove(&self, remote_id: &str) -> bool {
        let session = self.inner.lock().sessions.remove(remote_id);
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Wie `remove`, aber nur wenn die Session noch dieselbe ist
    pub async fn remove_if(&self, remote_id: &str, serial: u64) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            match inner.sessions.get(remote_id) {
                Some(s) if s.serial() == serial => inner.sessions.remove(remote_id),
                _ => None,
            }
        };
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Prüft ob `serial` die aktuelle Session zu `remote_id` ist
    pub fn is_current(&self, remote_id: &str, serial: u64) -> bool {
        let inner = self.inner.lock();
        !inner.sealed
            && inner
                .sessions
                .get(remote_id)
                .is_some_and(|s| s.serial() == serial)
    }

    /// Sortierter Snapshot aller Remote-IDs
    pub fn all(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, remote_id: &str) -> Option<Arc<PeerSession>> {
        self.inner.lock().sessions.get(remote_id).cloned()
    }

    pub fn state_of(&self, remote_id: &str) -> Option<NegotiationState> {
        self.get(remote_id).map(|s| s.state())
    }

    pub fn remote_stream(&self, remote_id: &str) -> Option<StreamHandle> {
        self.get(remote_id).and_then(|s| s.remote_stream())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Danach werden keine Sessions mehr angelegt oder beliefert
    pub fn seal(&self) {
        self.inner.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    /// Versiegelt das Registry und schließt alle Sessions parallel
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut inner = self.inner.lock();
            inner.sealed = true;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Closing peer sessions");
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("local_id", &self.context.local_id)
            .field("peers", &self.all())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
