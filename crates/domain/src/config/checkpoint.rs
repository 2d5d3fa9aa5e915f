use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Checkpoints
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    /// Tokens produced since the previous checkpoint that trigger the next.
    #[serde(default = "d_checkpoint_token_interval")]
    pub checkpoint_token_interval: u64,

    /// Settlement submission attempts per checkpoint before escalating.
    #[serde(default = "d_submit_max_attempts")]
    pub submit_max_attempts: u32,

    #[serde(default = "d_submit_backoff_base_ms")]
    pub submit_backoff_base_ms: u64,

    #[serde(default = "d_submit_backoff_max_ms")]
    pub submit_backoff_max_ms: u64,

    /// How long a closing session waits for the host to acknowledge the
    /// final checkpoint before dropping the connection anyway.
    #[serde(default = "d_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_token_interval: d_checkpoint_token_interval(),
            submit_max_attempts: d_submit_max_attempts(),
            submit_backoff_base_ms: d_submit_backoff_base_ms(),
            submit_backoff_max_ms: d_submit_backoff_max_ms(),
            ack_timeout_ms: d_ack_timeout_ms(),
        }
    }
}

impl CheckpointConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn submit_backoff(&self) -> Backoff {
        Backoff::from_millis(
            self.submit_backoff_base_ms,
            self.submit_backoff_max_ms,
            self.submit_max_attempts,
        )
    }
}

fn d_checkpoint_token_interval() -> u64 {
    100
}

fn d_submit_max_attempts() -> u32 {
    5
}

fn d_submit_backoff_base_ms() -> u64 {
    250
}

fn d_submit_backoff_max_ms() -> u64 {
    10_000
}

fn d_ack_timeout_ms() -> u64 {
    5_000
}
