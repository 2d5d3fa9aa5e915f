use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// A handshake that has not completed after this long moves the
    /// session to `Failed`.
    #[serde(default = "d_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Responder-side acceptance window for the session-init timestamp,
    /// in either direction.
    #[serde(default = "d_handshake_max_age_ms")]
    pub handshake_max_age_ms: u64,

    /// Hard cap on session lifetime.  Reaching it closes the session.
    #[serde(default = "d_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Close the session after this long without a prompt or token.
    #[serde(default = "d_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// `(prompt_tokens + completion_tokens) / context_window_size` above
    /// which the context-window warning fires.
    #[serde(default = "d_context_warning_threshold")]
    pub context_warning_threshold: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: d_handshake_timeout_ms(),
            handshake_max_age_ms: d_handshake_max_age_ms(),
            max_duration_secs: d_max_duration_secs(),
            idle_timeout_secs: d_idle_timeout_secs(),
            context_warning_threshold: d_context_warning_threshold(),
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn d_handshake_timeout_ms() -> u64 {
    10_000
}

fn d_handshake_max_age_ms() -> u64 {
    60_000
}

fn d_max_duration_secs() -> u64 {
    3_600
}

fn d_idle_timeout_secs() -> u64 {
    600
}

fn d_context_warning_threshold() -> f64 {
    0.8
}
