use serde::{Deserialize, Serialize};

/// Machine-readable error codes surfaced at the protocol boundary.
///
/// The first five are defined by the host wire protocol; the rest are raised
/// locally and share the same namespace so callers can match on one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    SessionExpired,
    TokenLimitExceeded,
    RateLimitExceeded,
    ModelNotAvailable,
    SessionNotFound,
    SessionAlreadyActive,
    DecryptionFailed,
    SignatureInvalid,
    UnauthorizedSender,
    StaleHandshake,
    ReplayedMessage,
    MalformedEnvelope,
    SequenceViolation,
    NetworkError,
    CheckpointFailed,
    InvalidState,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ModelNotAvailable => "MODEL_NOT_AVAILABLE",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionAlreadyActive => "SESSION_ALREADY_ACTIVE",
            Self::DecryptionFailed => "DECRYPTION_FAILED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::UnauthorizedSender => "UNAUTHORIZED_SENDER",
            Self::StaleHandshake => "STALE_HANDSHAKE",
            Self::ReplayedMessage => "REPLAYED_MESSAGE",
            Self::MalformedEnvelope => "MALFORMED_ENVELOPE",
            Self::SequenceViolation => "SEQUENCE_VIOLATION",
            Self::NetworkError => "NETWORK_ERROR",
            Self::CheckpointFailed => "CHECKPOINT_FAILED",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Failures establishing a session key.  Always fatal to the attempt.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("session-init payload failed to decrypt")]
    DecryptionFailed,
    #[error("session-init signature is invalid")]
    SignatureInvalid,
    #[error("signer {address} is not authorized to open a session")]
    UnauthorizedSender { address: String },
    #[error("session-init is stale (age {age_ms}ms, window {window_ms}ms)")]
    StaleHandshake { age_ms: i64, window_ms: u64 },
    #[error("no public key known for peer {0}")]
    UnknownPeer(String),
    #[error("malformed session-init: {0}")]
    Malformed(String),
    #[error("host rejected session-init: {0}")]
    Rejected(String),
    #[error("handshake did not complete within {0}ms")]
    Timeout(u64),
}

/// Violations on the encrypted stream.  Fatal to the offending message; the
/// connection is dropped so the session re-handshakes or resumes.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("replayed message: sequence {sequence} <= high-water {high_water}")]
    ReplayedMessage { sequence: u64, high_water: u64 },
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("sequence violation: envelope says {envelope}, aad says {aad}")]
    SequenceViolation { envelope: u64, aad: u64 },
    #[error("message failed authenticated decryption")]
    DecryptionFailed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("session already active: {0}")]
    SessionAlreadyActive(String),
    #[error("a generation is already in progress on this session")]
    GenerationInProgress,
    #[error("operation {op} not allowed in state {state}")]
    InvalidState { state: String, op: &'static str },
    #[error("session closed")]
    Closed,
}

/// Transport-level failures.  Retried with back-off before surfacing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint #{number} submission failed after {attempts} attempts: {message}")]
    SubmissionFailed {
        number: u64,
        attempts: u32,
        message: String,
    },
    #[error("checkpoint #{number} rejected: {message}")]
    Rejected { number: u64, message: String },
    #[error("checkpoint invariant violated: {0}")]
    InvariantViolation(String),
    #[error("checkpoint submitter stopped")]
    SubmitterStopped,
}

/// The host refused a prompt because it does not fit the context window.
/// Carries the host's exact figures; never retried by this crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("prompt of {prompt_tokens} tokens exceeds context window of {context_window_size}")]
pub struct TokenLimitError {
    pub prompt_tokens: u64,
    pub context_window_size: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared error type used across all sealwire crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("token limit: {0}")]
    TokenLimit(#[from] TokenLimitError),

    /// An `error` frame from the host that has no richer local mapping.
    #[error("host {code}: {message}")]
    Host { code: ErrorCode, message: String },

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Machine-readable code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Handshake(e) => match e {
                HandshakeError::DecryptionFailed => ErrorCode::DecryptionFailed,
                HandshakeError::SignatureInvalid => ErrorCode::SignatureInvalid,
                HandshakeError::UnauthorizedSender { .. } => ErrorCode::UnauthorizedSender,
                HandshakeError::StaleHandshake { .. } => ErrorCode::StaleHandshake,
                HandshakeError::Rejected(_) => ErrorCode::AuthFailed,
                HandshakeError::UnknownPeer(_) | HandshakeError::Malformed(_) => {
                    ErrorCode::AuthFailed
                }
                HandshakeError::Timeout(_) => ErrorCode::NetworkError,
            },
            Self::Protocol(e) => match e {
                ProtocolError::ReplayedMessage { .. } => ErrorCode::ReplayedMessage,
                ProtocolError::MalformedEnvelope(_) => ErrorCode::MalformedEnvelope,
                ProtocolError::SequenceViolation { .. } => ErrorCode::SequenceViolation,
                ProtocolError::DecryptionFailed => ErrorCode::DecryptionFailed,
            },
            Self::Session(e) => match e {
                SessionError::SessionNotFound(_) => ErrorCode::SessionNotFound,
                SessionError::SessionExpired(_) => ErrorCode::SessionExpired,
                SessionError::SessionAlreadyActive(_) => ErrorCode::SessionAlreadyActive,
                SessionError::GenerationInProgress
                | SessionError::InvalidState { .. }
                | SessionError::Closed => ErrorCode::InvalidState,
            },
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Checkpoint(_) => ErrorCode::CheckpointFailed,
            Self::TokenLimit(_) => ErrorCode::TokenLimitExceeded,
            Self::Host { code, .. } => *code,
            Self::Json(_) => ErrorCode::MalformedEnvelope,
            Self::Io(_) | Self::Config(_) => ErrorCode::Internal,
        }
    }

    /// Whether the failure is transient and worth retrying at a higher layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Checkpoint(CheckpointError::SubmissionFailed { .. })
                | Self::Host {
                    code: ErrorCode::RateLimitExceeded,
                    ..
                }
        )
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Handshake(e) => Self::Handshake(e.clone()),
            Self::Protocol(e) => Self::Protocol(e.clone()),
            Self::Session(e) => Self::Session(e.clone()),
            Self::Network(e) => Self::Network(e.clone()),
            Self::Checkpoint(e) => Self::Checkpoint(e.clone()),
            Self::TokenLimit(e) => Self::TokenLimit(e.clone()),
            Self::Host { code, message } => Self::Host {
                code: *code,
                message: message.clone(),
            },
            Self::Json(e) => Self::Config(format!("json: {e}")),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Config(m) => Self::Config(m.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
