//! Builder pattern for constructing a [`SessionClient`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sw_crypto::{IdentityDirectory, IdentityKeyStore};
use sw_domain::config::Config;
use sw_domain::error::Error;
use sw_domain::stream::ContextWarning;
use sw_sessions::{NoopSettlement, SettlementService};

use crate::client::SessionClient;
use crate::registry::SessionRegistry;

/// Called when a generation pushes context utilization past the threshold.
pub type ContextWarningHook = Arc<dyn Fn(&ContextWarning) + Send + Sync>;

/// Fluent builder for [`SessionClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use sw_client::{SessionClientBuilder, StaticDirectory, IdentityKeyStore};
/// let identity = IdentityKeyStore::generate();
/// let host_key = IdentityKeyStore::generate();
/// let directory = StaticDirectory::new().with_key(*host_key.public_key());
///
/// let client = SessionClientBuilder::new()
///     .identity(Arc::new(identity))
///     .directory(Arc::new(directory))
///     .on_context_warning(|w| eprintln!("context {:.0}% full", w.utilization * 100.0))
///     .build()
///     .unwrap();
/// ```
pub struct SessionClientBuilder {
    identity: Option<Arc<IdentityKeyStore>>,
    directory: Option<Arc<dyn IdentityDirectory>>,
    settlement: Arc<dyn SettlementService>,
    config: Config,
    on_context_warning: Option<ContextWarningHook>,
    shutdown: Option<CancellationToken>,
}

impl Default for SessionClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionClientBuilder {
    pub fn new() -> Self {
        Self {
            identity: None,
            directory: None,
            settlement: Arc::new(NoopSettlement),
            config: Config::default(),
            on_context_warning: None,
            shutdown: None,
        }
    }

    // ── Required ─────────────────────────────────────────────────────

    /// Long-term identity used to sign session-init and checkpoints.
    pub fn identity(mut self, identity: Arc<IdentityKeyStore>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Resolves host addresses to public keys.
    pub fn directory(mut self, directory: Arc<dyn IdentityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Where checkpoints are settled (default: discarded).
    pub fn settlement(mut self, settlement: Arc<dyn SettlementService>) -> Self {
        self.settlement = settlement;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn on_context_warning(
        mut self,
        hook: impl Fn(&ContextWarning) + Send + Sync + 'static,
    ) -> Self {
        self.on_context_warning = Some(Arc::new(hook));
        self
    }

    /// External shutdown signal.  Cancelling it closes every session.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Validate and build the client.
    pub fn build(self) -> Result<SessionClient, Error> {
        let identity = self
            .identity
            .ok_or_else(|| Error::Config("identity is required".into()))?;
        let directory = self
            .directory
            .ok_or_else(|| Error::Config("identity directory is required".into()))?;
        let config = self.config.validated()?;

        Ok(SessionClient {
            identity,
            directory,
            settlement: self.settlement,
            config: Arc::new(config),
            on_context_warning: self.on_context_warning,
            registry: SessionRegistry::new(),
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}
