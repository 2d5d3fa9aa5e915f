use std::path::Path;

use serde::{Deserialize, Serialize};

use sw_domain::config::ObservabilityConfig;
use sw_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Host
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Prompts longer than this many words are refused with
    /// `TOKEN_LIMIT_EXCEEDED`; completions are capped to what is left.
    #[serde(default = "d_context_window")]
    pub context_window: u64,

    /// Announced in `connected`.
    #[serde(default = "d_models")]
    pub models: Vec<String>,

    /// Acceptance window for the session-init timestamp.
    #[serde(default = "d_handshake_max_age_ms")]
    pub handshake_max_age_ms: u64,

    #[serde(default = "d_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Pause between streamed tokens.
    #[serde(default)]
    pub token_delay_ms: u64,

    /// Never answer `session_init`.  For exercising client timeouts.
    #[serde(default)]
    pub silent_handshake: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            context_window: d_context_window(),
            models: d_models(),
            handshake_max_age_ms: d_handshake_max_age_ms(),
            max_message_bytes: d_max_message_bytes(),
            token_delay_ms: 0,
            silent_handshake: false,
        }
    }
}

fn d_context_window() -> u64 {
    4096
}

fn d_models() -> Vec<String> {
    vec!["echo-1".into()]
}

fn d_handshake_max_age_ms() -> u64 {
    60_000
}

fn d_max_message_bytes() -> usize {
    1024 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// On-disk layout of the host binary's config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostFile {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Signer addresses allowed to open sessions.  Empty allows anyone.
    #[serde(default)]
    pub allow: Vec<String>,
}

impl HostFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_sections_take_defaults() {
        let file: HostFile = toml::from_str("").unwrap();
        assert_eq!(file.host, HostConfig::default());
        assert!(file.allow.is_empty());
    }

    #[test]
    fn loads_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "allow = [\"0xabc\"]\n[host]\ncontext_window = 64\ntoken_delay_ms = 5"
        )
        .unwrap();
        let file = HostFile::load(f.path()).unwrap();
        assert_eq!(file.host.context_window, 64);
        assert_eq!(file.host.token_delay_ms, 5);
        assert_eq!(file.host.models, vec!["echo-1".to_string()]);
        assert_eq!(file.allow, vec!["0xabc".to_string()]);
    }
}
