//! Session lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};

/// Where a session is in its lifecycle.
///
/// ```text
/// Uninitialized → HandshakePending → Active ⇄ Checkpointing
///                        │             │  ↑
///                        │             ↓  │
///                        │          Resuming
///                        ↓             │
///                      Failed ←────────┘      Active | Resuming → Closing → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    HandshakePending,
    Active,
    Checkpointing,
    Resuming,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, HandshakePending)
                | (HandshakePending, Active)
                | (HandshakePending, Failed)
                | (Active, Checkpointing)
                | (Checkpointing, Active)
                | (Active, Resuming)
                | (Checkpointing, Resuming)
                | (Resuming, Active)
                | (Resuming, Failed)
                | (Active, Failed)
                | (Active, Closing)
                | (Checkpointing, Closing)
                | (Resuming, Closing)
                | (Closing, Closed)
        )
    }

    /// A session key is installed exactly in these states.
    pub fn holds_session_key(self) -> bool {
        matches!(self, Self::Active | Self::Checkpointing | Self::Resuming)
    }

    /// New prompts are accepted.
    pub fn accepts_prompts(self) -> bool {
        matches!(self, Self::Active | Self::Checkpointing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::HandshakePending => "handshake_pending",
            Self::Active => "active",
            Self::Checkpointing => "checkpointing",
            Self::Resuming => "resuming",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of the handshake this process played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiator,
    Responder,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        })
    }
}
