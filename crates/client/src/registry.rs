//! Process-wide map of live sessions.
//!
//! Each entry is a [`SessionSlot`]: the session record the owning task
//! keeps current, the slot holding its key material, and the command
//! channel into the task.  The map lock is only taken to insert, look up, or
//! remove a slot; per-message work goes straight to the slot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use sw_crypto::SessionCrypto;
use sw_domain::error::{Error, SessionError};
use sw_domain::trace::TraceEvent;
use sw_sessions::{Session, SessionState, SettlementLedger};

use crate::machine::Command;

/// Shared state of one session.
pub struct SessionSlot {
    record: RwLock<Session>,
    key: Mutex<Option<SessionCrypto>>,
    state: watch::Sender<SessionState>,
    ledger: watch::Receiver<SettlementLedger>,
    /// Why the session ended in `Failed`.
    failure: Mutex<Option<Error>>,
    pub(crate) commands: mpsc::Sender<Command>,
}

impl SessionSlot {
    pub(crate) fn new(
        record: Session,
        commands: mpsc::Sender<Command>,
        ledger: watch::Receiver<SettlementLedger>,
    ) -> Self {
        let (state, _) = watch::channel(record.state);
        Self {
            record: RwLock::new(record),
            key: Mutex::new(None),
            state,
            ledger,
            failure: Mutex::new(None),
            commands,
        }
    }

    pub fn id(&self) -> String {
        self.record.read().id.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn snapshot(&self) -> Session {
        self.record.read().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn settlement(&self) -> SettlementLedger {
        self.ledger.borrow().clone()
    }

    pub fn failure(&self) -> Option<Error> {
        self.failure.lock().clone()
    }

    pub(crate) fn record_failure(&self, err: Error) {
        *self.failure.lock() = Some(err);
    }

    pub fn has_key(&self) -> bool {
        self.key.lock().is_some()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut Session)) {
        f(&mut self.record.write());
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.record.write().state = state;
        self.state.send_replace(state);
    }

    pub(crate) fn install_key(&self, crypto: SessionCrypto) {
        *self.key.lock() = Some(crypto);
    }

    /// Run `f` against the installed key, or fail if it has been purged.
    pub(crate) fn with_key<T>(
        &self,
        f: impl FnOnce(&mut SessionCrypto) -> T,
    ) -> Result<T, SessionError> {
        let mut key = self.key.lock();
        match key.as_mut() {
            Some(crypto) => Ok(f(crypto)),
            None => Err(SessionError::Closed),
        }
    }

    /// Drop the session key.  Returns whether one was installed.
    pub(crate) fn purge_key(&self) -> bool {
        let taken = self.key.lock().take();
        match taken {
            Some(crypto) => {
                let session_id = crypto.session_id().to_string();
                crypto.purge();
                TraceEvent::KeyMaterialPurged { session_id }.emit();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("record", &*self.record.read())
            .field("has_key", &self.has_key())
            .finish_non_exhaustive()
    }
}

/// Thread-safe registry of all live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionSlot>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a new session.  At most one live session per id.
    pub(crate) fn reserve(&self, slot: SessionSlot) -> Result<Arc<SessionSlot>, SessionError> {
        let id = slot.id();
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(SessionError::SessionAlreadyActive(id));
        }
        let slot = Arc::new(slot);
        sessions.insert(id.clone(), slot.clone());
        tracing::info!(session_id = %id, live = sessions.len(), "session registered");
        Ok(slot)
    }

    /// Purge key material and drop the entry.  Called on `Closed`/`Failed`.
    pub(crate) fn finish(&self, id: &str) {
        let removed = self.sessions.write().remove(id);
        if let Some(slot) = removed {
            slot.purge_key();
            tracing::info!(session_id = %id, state = %slot.state(), "session removed");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).map(|s| s.snapshot())
    }

    /// Snapshots of every live session.
    pub fn list(&self) -> Vec<Session> {
        self.sessions.read().values().map(|s| s.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Purge every key and empty the map.
    pub(crate) fn purge_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        for (id, slot) in &drained {
            slot.purge_key();
            tracing::info!(session_id = %id, "session purged");
        }
        drained.len()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sw_crypto::SessionKey;
    use sw_sessions::SessionRole;

    fn slot(id: &str) -> SessionSlot {
        let (tx, _rx) = mpsc::channel(1);
        let (_ledger_tx, ledger_rx) = watch::channel(SettlementLedger::default());
        SessionSlot::new(
            Session::new(id, SessionRole::Initiator, "0xhost", Duration::from_secs(60)),
            tx,
            ledger_rx,
        )
    }

    #[test]
    fn one_live_session_per_id() {
        let reg = SessionRegistry::new();
        reg.reserve(slot("s1")).unwrap();
        let err = reg.reserve(slot("s1")).unwrap_err();
        assert_eq!(err, SessionError::SessionAlreadyActive("s1".into()));
        reg.reserve(slot("s2")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn finish_purges_the_key_and_frees_the_id() {
        let reg = SessionRegistry::new();
        let s = reg.reserve(slot("s1")).unwrap();
        s.install_key(SessionCrypto::initiator("s1", SessionKey::random()));
        assert!(s.has_key());

        reg.finish("s1");
        assert!(!s.has_key());
        assert!(reg.get("s1").is_none());
        assert!(reg.reserve(slot("s1")).is_ok());
    }

    #[test]
    fn with_key_fails_after_purge() {
        let s = slot("s1");
        s.install_key(SessionCrypto::initiator("s1", SessionKey::random()));
        assert!(s.with_key(|c| c.encrypt_outbound(b"x")).is_ok());
        assert!(s.purge_key());
        assert!(!s.purge_key());
        assert_eq!(
            s.with_key(|c| c.outbound_sequence()).unwrap_err(),
            SessionError::Closed
        );
    }

    #[test]
    fn state_changes_reach_snapshots_and_watchers() {
        let s = slot("s1");
        let rx = s.subscribe_state();
        s.set_state(SessionState::HandshakePending);
        assert_eq!(s.snapshot().state, SessionState::HandshakePending);
        assert_eq!(*rx.borrow(), SessionState::HandshakePending);
    }

    #[test]
    fn purge_all_empties_the_map() {
        let reg = SessionRegistry::new();
        let a = reg.reserve(slot("a")).unwrap();
        a.install_key(SessionCrypto::initiator("a", SessionKey::random()));
        reg.reserve(slot("b")).unwrap();
        assert_eq!(reg.purge_all(), 2);
        assert!(reg.is_empty());
        assert!(!a.has_key());
    }
}
