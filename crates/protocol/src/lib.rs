//! Session protocol: WebSocket message types, the decrypted payloads carried
//! inside `encrypted_message`, and the signed checkpoint wire form.
//!
//! Every binary field (keys, nonces, ciphertexts, signatures, digests) is
//! lowercase hex.

use serde::{Deserialize, Serialize};

use sw_domain::error::{Error, ErrorCode, SessionError, TokenLimitError};
use sw_domain::stream::{FinishReason, Usage};

/// Wire protocol version announced in `connected`.
pub const PROTOCOL_VERSION: u32 = 1;

/// WebSocket message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    /// Host → Client: first frame after the socket opens.
    #[serde(rename = "connected")]
    Connected {
        protocol_version: u32,
        capabilities: Vec<String>,
        models: Vec<String>,
    },

    /// Client → Host: encrypted, signed session-init envelope.
    #[serde(rename = "session_init")]
    SessionInit(SessionInitEnvelope),

    /// Host → Client: handshake verdict.
    #[serde(rename = "session_init_ack")]
    SessionInitAck {
        accepted: bool,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Client → Host: re-attach to an existing session after reconnect.
    #[serde(rename = "session_resume")]
    SessionResume {
        session_id: String,
        last_checkpoint: u64,
        token_count: u64,
    },

    /// Host → Client: resume verdict with the host's last known checkpoint.
    #[serde(rename = "session_resume_ack")]
    SessionResumeAck {
        session_id: String,
        accepted: bool,
        last_checkpoint: u64,
    },

    /// Bidirectional: AEAD-protected session payload.
    #[serde(rename = "encrypted_message")]
    EncryptedMessage(EncryptedEnvelope),

    /// Client → Host: signed proof of progress.
    #[serde(rename = "checkpoint")]
    Checkpoint {
        session_id: String,
        checkpoint: Checkpoint,
    },

    /// Host → Client: checkpoint received.
    #[serde(rename = "checkpoint_ack")]
    CheckpointAck { session_id: String, number: u64 },

    /// Client → Host: session is closing; no further prompts.
    #[serde(rename = "session_end")]
    SessionEnd { session_id: String, reason: String },

    /// Bidirectional: heartbeat.
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    /// Bidirectional: heartbeat response.
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Host → Client: request-level failure.
    #[serde(rename = "error")]
    Error(ErrorFrame),
}

impl WsMessage {
    /// Wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SessionInit(_) => "session_init",
            Self::SessionInitAck { .. } => "session_init_ack",
            Self::SessionResume { .. } => "session_resume",
            Self::SessionResumeAck { .. } => "session_resume_ack",
            Self::EncryptedMessage(_) => "encrypted_message",
            Self::Checkpoint { .. } => "checkpoint",
            Self::CheckpointAck { .. } => "checkpoint_ack",
            Self::SessionEnd { .. } => "session_end",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error(_) => "error",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The handshake envelope.  `nonce` is both the HKDF salt and the AEAD nonce
/// for the init payload; `signature` covers `ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInitEnvelope {
    pub ephemeral_public_key: String,
    pub nonce: String,
    pub ciphertext: String,
    pub signature: String,
}

/// One encrypted session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub session_id: String,
    pub sequence: u64,
    pub nonce: String,
    pub aad: String,
    pub ciphertext: String,
}

/// A signed proof of progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub number: u64,
    pub token_count: u64,
    pub digest: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub signature: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decrypted payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters the requester fixes at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// Plaintext of `session_init.ciphertext`.  Holds the session key in hex;
/// callers zeroize the serialized buffer once it is sealed or parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInitPayload {
    pub session_id: String,
    pub session_key: String,
    pub params: SessionParams,
    /// Unix milliseconds at the initiator.
    pub timestamp: i64,
}

/// Client → Host payloads inside `encrypted_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientPayload {
    Prompt {
        request_id: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u64>,
    },
    Cancel {
        request_id: String,
    },
}

/// Host → Client payloads inside `encrypted_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostPayload {
    StreamChunk {
        content: String,
        index: u64,
    },
    StreamEnd {
        finish_reason: FinishReason,
        usage: Usage,
        duration_ms: u64,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `error` frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Structured context for an [`ErrorFrame`].  Which fields are set depends on
/// the code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorFrame {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            session_id: None,
            details: None,
        }
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn token_limit(prompt_tokens: u64, context_window_size: u64) -> Self {
        Self {
            code: ErrorCode::TokenLimitExceeded,
            message: format!(
                "prompt of {prompt_tokens} tokens exceeds context window of {context_window_size}"
            ),
            session_id: None,
            details: Some(ErrorDetails {
                prompt_tokens: Some(prompt_tokens),
                context_window_size: Some(context_window_size),
                retry_after_ms: None,
            }),
        }
    }

    /// Map to the local error taxonomy, keeping the host's figures.
    pub fn into_error(self) -> Error {
        let session = self.session_id.clone().unwrap_or_default();
        match self.code {
            ErrorCode::TokenLimitExceeded => {
                let details = self.details.unwrap_or_default();
                match (details.prompt_tokens, details.context_window_size) {
                    (Some(prompt_tokens), Some(context_window_size)) => {
                        TokenLimitError {
                            prompt_tokens,
                            context_window_size,
                        }
                        .into()
                    }
                    _ => Error::Host {
                        code: self.code,
                        message: self.message,
                    },
                }
            }
            ErrorCode::SessionExpired => SessionError::SessionExpired(session).into(),
            ErrorCode::SessionNotFound => SessionError::SessionNotFound(session).into(),
            code => Error::Host {
                code,
                message: self.message,
            },
        }
    }
}
