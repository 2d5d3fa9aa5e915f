use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::Backoff;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Consecutive failed connection attempts before a terminal
    /// `NetworkError`.  `0` retries forever.
    #[serde(default = "d_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// First reconnect delay; doubles per attempt.
    #[serde(default = "d_reconnect_backoff_base_ms")]
    pub reconnect_backoff_base_ms: u64,

    #[serde(default = "d_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,

    /// How often the client emits `ping`.
    #[serde(default = "d_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence on the inbound side for this long counts as a disconnect.
    #[serde(default = "d_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Inbound frames above this size are dropped before parsing.
    #[serde(default = "d_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_max_attempts: d_reconnect_max_attempts(),
            reconnect_backoff_base_ms: d_reconnect_backoff_base_ms(),
            reconnect_backoff_max_ms: d_reconnect_backoff_max_ms(),
            heartbeat_interval_ms: d_heartbeat_interval_ms(),
            liveness_timeout_ms: d_liveness_timeout_ms(),
            max_message_bytes: d_max_message_bytes(),
        }
    }
}

impl TransportConfig {
    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::from_millis(
            self.reconnect_backoff_base_ms,
            self.reconnect_backoff_max_ms,
            self.reconnect_max_attempts,
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

fn d_reconnect_max_attempts() -> u32 {
    5
}

fn d_reconnect_backoff_base_ms() -> u64 {
    500
}

fn d_reconnect_backoff_max_ms() -> u64 {
    30_000
}

fn d_heartbeat_interval_ms() -> u64 {
    15_000
}

fn d_liveness_timeout_ms() -> u64 {
    45_000
}

fn d_max_message_bytes() -> usize {
    1024 * 1024
}
