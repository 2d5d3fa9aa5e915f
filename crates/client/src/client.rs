//! [`SessionClient`]: opens sessions against hosts and tracks them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use sw_crypto::{IdentityDirectory, IdentityKeyStore};
use sw_domain::config::Config;
use sw_domain::error::{Error, SessionError};
use sw_protocol::SessionParams;
use sw_sessions::{CheckpointSubmitter, Session, SessionRole, SessionState, SettlementService};

use crate::builder::{ContextWarningHook, SessionClientBuilder};
use crate::handle::SessionHandle;
use crate::machine::{MachineParts, SessionMachine};
use crate::registry::{SessionRegistry, SessionSlot};

/// How long [`SessionClient::shutdown`] waits for sessions to close before
/// purging what is left.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Entry point of the SDK.  Build with
/// [`SessionClientBuilder`](crate::SessionClientBuilder).
pub struct SessionClient {
    pub(crate) identity: Arc<IdentityKeyStore>,
    pub(crate) directory: Arc<dyn IdentityDirectory>,
    pub(crate) settlement: Arc<dyn SettlementService>,
    pub(crate) config: Arc<Config>,
    pub(crate) on_context_warning: Option<ContextWarningHook>,
    pub(crate) registry: SessionRegistry,
    pub(crate) shutdown: CancellationToken,
}

impl SessionClient {
    pub fn builder() -> SessionClientBuilder {
        SessionClientBuilder::new()
    }

    /// This client's address.
    pub fn address(&self) -> &str {
        self.identity.address()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a session with a fresh id.
    pub async fn start_session(
        &self,
        host_address: &str,
        host_url: &str,
        params: SessionParams,
    ) -> Result<SessionHandle, Error> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.start_session_with_id(&session_id, host_address, host_url, params)
            .await
    }

    /// Open a session under a caller-chosen id.  Fails with
    /// `SessionAlreadyActive` while another live session holds the id.
    pub async fn start_session_with_id(
        &self,
        session_id: &str,
        host_address: &str,
        host_url: &str,
        params: SessionParams,
    ) -> Result<SessionHandle, Error> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Closed.into());
        }

        let (commands_tx, commands_rx) = mpsc::channel(32);
        let submitter = CheckpointSubmitter::spawn(
            session_id,
            self.settlement.clone(),
            self.config.checkpoint.submit_backoff().seeded(session_id),
        );
        let record = Session::new(
            session_id,
            SessionRole::Initiator,
            host_address,
            self.config.session.max_duration(),
        );
        let slot = self
            .registry
            .reserve(SessionSlot::new(record, commands_tx, submitter.subscribe()))?;

        let mut machine = SessionMachine::new(MachineParts {
            session_id: session_id.to_string(),
            peer_address: host_address.to_string(),
            url: host_url.to_string(),
            slot: slot.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            identity: self.identity.clone(),
            submitter,
            commands: commands_rx,
            on_context_warning: self.on_context_warning.clone(),
            shutdown: self.shutdown.child_token(),
        });

        tracing::info!(session_id, host = host_address, url = host_url, "starting session");

        let directory = self.directory.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = machine.establish(directory.as_ref(), params).await;
            let established = result.is_ok();
            let _ = ready_tx.send(result);
            if established {
                machine.run().await;
            }
        });

        ready_rx
            .await
            .map_err(|_| SessionError::SessionNotFound(session_id.to_string()))??;
        Ok(SessionHandle::new(slot))
    }

    /// Handle to a live session.
    pub fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.registry.get(session_id).map(SessionHandle::new)
    }

    /// Snapshots of every live session.
    pub fn sessions(&self) -> Vec<Session> {
        self.registry.list()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Close every session, abandoning unsettled checkpoints, and purge
    /// whatever key material is left once the grace period ends.
    pub async fn shutdown(&self) {
        tracing::info!(live = self.registry.len(), "shutting down");
        self.shutdown.cancel();

        let handles: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter_map(|s| self.session(&s.id))
            .collect();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for handle in &handles {
                handle.wait_for_state(SessionState::Closed).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = self.registry.len(), "sessions still closing at shutdown");
        }

        let purged = self.registry.purge_all();
        if purged > 0 {
            tracing::warn!(purged, "purged sessions that did not close in time");
        }
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("address", &self.identity.address())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
