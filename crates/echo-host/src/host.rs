//! Listener, shared host state, and the test-facing control handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sw_crypto::{AuthorizationCheck, IdentityKeyStore, SessionCrypto};
use sw_domain::error::Result;
use sw_domain::trace::TraceEvent;
use sw_protocol::Checkpoint;

use crate::config::HostConfig;
use crate::connection::serve_connection;

/// Host side of one established session.  Outlives any single connection.
pub(crate) struct HostSession {
    pub id: String,
    pub peer_address: String,
    crypto: Mutex<Option<SessionCrypto>>,
}

impl HostSession {
    pub(crate) fn new(id: String, peer_address: String, crypto: SessionCrypto) -> Self {
        Self {
            id,
            peer_address,
            crypto: Mutex::new(Some(crypto)),
        }
    }

    /// Run `f` against the session key; `None` once purged.
    pub(crate) fn with_crypto<T>(&self, f: impl FnOnce(&mut SessionCrypto) -> T) -> Option<T> {
        self.crypto.lock().as_mut().map(f)
    }

    fn purge(&self) {
        if let Some(crypto) = self.crypto.lock().take() {
            crypto.purge();
            TraceEvent::KeyMaterialPurged {
                session_id: self.id.clone(),
            }
            .emit();
        }
    }
}

pub(crate) struct HostState {
    pub identity: Arc<IdentityKeyStore>,
    pub authz: Arc<dyn AuthorizationCheck>,
    pub config: HostConfig,
    pub sessions: RwLock<HashMap<String, Arc<HostSession>>>,
    /// Received checkpoints per session id.  Kept after the session ends.
    pub checkpoints: RwLock<HashMap<String, Vec<Checkpoint>>>,
    /// Parent of every live connection's token.  Replaced on each
    /// [`HostControl::drop_connections`].
    connections: Mutex<CancellationToken>,
    /// Cancelled for connections that must go silent.  Replaced on each
    /// [`HostControl::stall_connections`].
    stall: Mutex<CancellationToken>,
    duplicate_next: AtomicBool,
}

impl HostState {
    pub(crate) fn connection_token(&self) -> CancellationToken {
        self.connections.lock().child_token()
    }

    pub(crate) fn stall_token(&self) -> CancellationToken {
        self.stall.lock().clone()
    }

    /// Consume a pending [`HostControl::duplicate_next_message`].
    pub(crate) fn take_duplicate(&self) -> bool {
        self.duplicate_next.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn session(&self, id: &str) -> Option<Arc<HostSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Insert unless the id is taken.
    pub(crate) fn insert_session(&self, session: Arc<HostSession>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return false;
        }
        tracing::info!(session_id = %session.id, peer = %session.peer_address, "session established");
        sessions.insert(session.id.clone(), session);
        true
    }

    pub(crate) fn end_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(session) => {
                session.purge();
                true
            }
            None => false,
        }
    }

    pub(crate) fn last_checkpoint(&self, id: &str) -> u64 {
        self.checkpoints
            .read()
            .get(id)
            .and_then(|log| log.last())
            .map(|cp| cp.number)
            .unwrap_or(0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Host
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Responder that streams prompt words back as tokens.
pub struct EchoHost {
    identity: Arc<IdentityKeyStore>,
    authz: Arc<dyn AuthorizationCheck>,
    config: HostConfig,
}

impl EchoHost {
    pub fn new(
        identity: Arc<IdentityKeyStore>,
        authz: Arc<dyn AuthorizationCheck>,
        config: HostConfig,
    ) -> Self {
        Self {
            identity,
            authz,
            config,
        }
    }

    pub fn address(&self) -> &str {
        self.identity.address()
    }

    /// Public key clients put in their identity directory.
    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Bind `addr` (e.g. `127.0.0.1:0`) and start accepting connections.
    pub async fn bind(self, addr: &str) -> Result<RunningHost> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(HostState {
            identity: self.identity,
            authz: self.authz,
            config: self.config,
            sessions: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            connections: Mutex::new(CancellationToken::new()),
            stall: Mutex::new(CancellationToken::new()),
            duplicate_next: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();

        tracing::info!(addr = %local_addr, address = %state.identity.address(), "echo host listening");

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    r = listener.accept() => r,
                    _ = accept_shutdown.cancelled() => break,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let cancel = accept_state.connection_token();
                        tokio::spawn(serve_connection(accept_state.clone(), stream, peer, cancel));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
            tracing::info!("echo host stopped accepting");
        });

        Ok(RunningHost {
            addr: local_addr,
            control: HostControl { state },
            shutdown,
            task,
        })
    }
}

/// A bound host.  Dropping it stops the listener and every connection.
pub struct RunningHost {
    addr: SocketAddr,
    control: HostControl,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningHost {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL clients dial.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn control(&self) -> &HostControl {
        &self.control
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.control.drop_connections();
    }

    /// Wait for the accept loop to exit.
    pub async fn wait(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for RunningHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Inspection and fault injection.
#[derive(Clone)]
pub struct HostControl {
    state: Arc<HostState>,
}

impl HostControl {
    pub fn address(&self) -> &str {
        self.state.identity.address()
    }

    /// Sever every open connection without a close frame.  Sessions and
    /// their keys survive, so clients can resume.
    pub fn drop_connections(&self) {
        let mut token = self.state.connections.lock();
        token.cancel();
        *token = CancellationToken::new();
        tracing::info!("dropped all connections");
    }

    /// Open connections stop writing, pongs included, but stay open.
    /// Connections accepted afterwards are unaffected.
    pub fn stall_connections(&self) {
        let mut token = self.state.stall.lock();
        token.cancel();
        *token = CancellationToken::new();
        tracing::info!("stalled all connections");
    }

    /// Write the next `encrypted_message` twice, byte for byte.
    pub fn duplicate_next_message(&self) {
        self.state.duplicate_next.store(true, Ordering::Release);
    }

    /// Checkpoints received for `session_id`, in order.
    pub fn checkpoints(&self, session_id: &str) -> Vec<Checkpoint> {
        self.state
            .checkpoints
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `session_id` is a live host session.
    pub fn knows(&self, session_id: &str) -> bool {
        self.state.sessions.read().contains_key(session_id)
    }

    /// End a session host-side.  A later resume is refused.
    pub fn forget_session(&self, session_id: &str) -> bool {
        self.state.end_session(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.read().len()
    }
}

impl std::fmt::Debug for HostControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostControl")
            .field("address", &self.address())
            .field("sessions", &self.session_count())
            .finish()
    }
}
