//! `sw-echo-host` - a minimal responder for the session protocol.
//!
//! Accepts WebSocket connections, answers `session_init` handshakes, and
//! streams each prompt back one word per token over the encrypted channel.
//! Checkpoints are verified against the session's peer and recorded.
//!
//! Used as the reference peer by the client's integration tests and as a
//! standalone binary for manual runs.  [`HostControl`] exposes the recorded
//! checkpoints and can sever connections to exercise resume.

pub mod config;
mod connection;
pub mod host;

pub use config::{HostConfig, HostFile};
pub use host::{EchoHost, HostControl, RunningHost};
