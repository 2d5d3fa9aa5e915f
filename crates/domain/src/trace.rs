use serde::Serialize;

/// Structured trace events emitted across all sealwire crates.
///
/// Never carries key material or plaintext payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    HandshakeCompleted {
        session_id: String,
        peer_address: String,
        role: String,
        duration_ms: u64,
    },
    HandshakeRejected {
        reason: String,
    },
    StateChanged {
        session_id: String,
        from: String,
        to: String,
    },
    CheckpointCreated {
        session_id: String,
        number: u64,
        token_count: u64,
    },
    CheckpointAcknowledged {
        session_id: String,
        number: u64,
        attempts: u32,
    },
    SessionResumed {
        session_id: String,
        last_checkpoint: u64,
        attempts: u32,
    },
    GenerationFinished {
        session_id: String,
        finish_reason: String,
        completion_tokens: u64,
        duration_ms: u64,
    },
    KeyMaterialPurged {
        session_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sw_event");
    }
}
