mod checkpoint;
mod observability;
mod session;
mod transport;

pub use checkpoint::*;
pub use observability::*;
pub use session::*;
pub use transport::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every tunable of the session engine, grouped by concern.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a TOML document.  Missing sections and fields take defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a TOML file on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Validate and fail on the first error-severity issue; warnings are
    /// logged.
    pub fn validated(self) -> Result<Self> {
        let issues = self.validate();
        for issue in &issues {
            if issue.severity == ConfigSeverity::Warning {
                tracing::warn!(field = %issue.field, "{}", issue.message);
            }
        }
        if let Some(err) = issues
            .into_iter()
            .find(|i| i.severity == ConfigSeverity::Error)
        {
            return Err(Error::Config(err.to_string()));
        }
        Ok(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut error = |field: &str, message: &str| {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message: message.into(),
            })
        };

        if self.session.handshake_timeout_ms == 0 {
            error("session.handshake_timeout_ms", "must be greater than 0");
        }
        if self.session.handshake_max_age_ms == 0 {
            error("session.handshake_max_age_ms", "must be greater than 0");
        }
        let t = self.session.context_warning_threshold;
        if !(t > 0.0 && t <= 1.0) {
            error(
                "session.context_warning_threshold",
                "must be in the range (0, 1]",
            );
        }
        if self.checkpoint.checkpoint_token_interval == 0 {
            error(
                "checkpoint.checkpoint_token_interval",
                "must be greater than 0",
            );
        }
        if self.transport.reconnect_backoff_base_ms == 0 {
            error("transport.reconnect_backoff_base_ms", "must be greater than 0");
        }
        if self.transport.max_message_bytes < 1024 {
            error("transport.max_message_bytes", "must be at least 1024");
        }

        // Warnings.
        if self.transport.liveness_timeout_ms <= self.transport.heartbeat_interval_ms {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "transport.liveness_timeout_ms".into(),
                message: "should exceed heartbeat_interval_ms or every missed pong resumes the session".into(),
            });
        }
        if self.transport.reconnect_max_attempts == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "transport.reconnect_max_attempts".into(),
                message: "0 retries forever; a dead host will never fail the session".into(),
            });
        }

        errors
    }
}
