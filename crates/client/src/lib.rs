//! `sw-client` - requester side of a sealwire session.
//!
//! A client opens end-to-end encrypted sessions with compute hosts over
//! WebSocket, streams prompts and decrypted tokens through them, and signs
//! checkpoints of the work received.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  SessionClientBuilder::new()                              │
//! │      .identity(identity)                                  │
//! │      .directory(directory)                                │
//! │      .build()?                                            │
//! │      .start_session(host_address, host_url, params)       │
//! │      .await?                                              │
//! │      .prompt("...")                                       │
//! │      .await?      → TokenStream of decrypted tokens       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Session flow
//!
//! 1. Connect WS and wait for `connected`
//! 2. Send `session_init` (ECDH, HKDF, AEAD, signature); wait for the ack
//! 3. Main loop, one task per session:
//!    - prompts go out as `encrypted_message`; chunks come back the same way
//!    - every N tokens a signed `checkpoint` is sent and queued for settlement
//!    - on disconnect: reconnect with jittered back-off and `session_resume`
//! 4. Close: flush the final checkpoint, send `session_end`, wait for
//!    settlement, purge the session key

pub mod builder;
pub mod client;
pub mod handle;
pub mod reconnect;
pub mod registry;
pub mod transport;

mod machine;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::{ContextWarningHook, SessionClientBuilder};
pub use client::SessionClient;
pub use handle::{SessionHandle, TokenStream};
pub use registry::SessionRegistry;
pub use transport::{Transport, TransportEvent};

pub use sw_crypto::{AllowList, IdentityDirectory, IdentityKeyStore, StaticDirectory};
pub use sw_domain::config::Config;
pub use sw_domain::error::{Error, ErrorCode};
pub use sw_domain::stream::{Completion, ContextWarning, FinishReason, StreamToken, Usage};
pub use sw_protocol::SessionParams;
pub use sw_sessions::{
    NoopSettlement, Session, SessionState, SettlementError, SettlementOutcome, SettlementService,
};
