//! Shared domain types for the sealwire session protocol: the error
//! taxonomy, typed configuration, retry back-off, and the provider-agnostic
//! token stream types every other crate speaks.

pub mod backoff;
pub mod config;
pub mod error;
pub mod stream;
pub mod trace;

pub use backoff::Backoff;
pub use error::ErrorCode;
pub use error::{
    CheckpointError, Error, HandshakeError, NetworkError, ProtocolError, Result, SessionError,
    TokenLimitError,
};
