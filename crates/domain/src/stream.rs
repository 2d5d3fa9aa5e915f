use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One decrypted token chunk, in stream order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamToken {
    pub content: String,
    pub index: u64,
}

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Token usage reported by the host at the end of a generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub context_window_size: u64,
}

impl Usage {
    /// Fraction of the context window consumed, or `None` when the host did
    /// not report a window size.
    pub fn context_utilization(&self) -> Option<f64> {
        if self.context_window_size == 0 {
            return None;
        }
        let used = self.prompt_tokens + self.completion_tokens;
        Some(used as f64 / self.context_window_size as f64)
    }
}

/// Terminal summary of one prompt exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub duration_ms: u64,
    /// Cumulative tokens produced on the session after this generation.
    pub session_token_count: u64,
    /// Number of the last checkpoint materialized when the generation ended.
    pub last_checkpoint_number: u64,
}

/// Fired when a generation pushes context utilization past the configured
/// threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextWarning {
    pub session_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub context_window_size: u64,
    pub utilization: f64,
    pub threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_uses_prompt_plus_completion() {
        let u = Usage {
            prompt_tokens: 600,
            completion_tokens: 250,
            total_tokens: 850,
            context_window_size: 1000,
        };
        let ratio = u.context_utilization().unwrap();
        assert!((ratio - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn utilization_unknown_without_window() {
        assert!(Usage::default().context_utilization().is_none());
    }

    #[test]
    fn finish_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&FinishReason::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let r: FinishReason = serde_json::from_str("\"length\"").unwrap();
        assert_eq!(r, FinishReason::Length);
    }
}
