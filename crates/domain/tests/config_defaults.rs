use std::io::Write;

use sw_domain::config::{Config, ConfigSeverity, LogFormat};

#[test]
fn defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.session.handshake_timeout_ms, 10_000);
    assert_eq!(config.transport.reconnect_max_attempts, 5);
    assert_eq!(config.transport.reconnect_backoff_base_ms, 500);
    assert_eq!(config.checkpoint.checkpoint_token_interval, 100);
    assert_eq!(config.checkpoint.ack_timeout_ms, 5_000);
    assert!((config.session.context_warning_threshold - 0.8).abs() < f64::EPSILON);
}

#[test]
fn default_config_validates_clean() {
    let issues = Config::default().validate();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

#[test]
fn partial_toml_keeps_other_defaults() {
    let toml_str = r#"
[checkpoint]
checkpoint_token_interval = 250

[transport]
reconnect_max_attempts = 2
"#;
    let config = Config::from_toml_str(toml_str).unwrap();
    assert_eq!(config.checkpoint.checkpoint_token_interval, 250);
    assert_eq!(config.transport.reconnect_max_attempts, 2);
    assert_eq!(config.session.handshake_timeout_ms, 10_000);
    assert_eq!(config.observability.log_format, LogFormat::Json);
}

#[test]
fn zero_interval_is_an_error() {
    let toml_str = r#"
[checkpoint]
checkpoint_token_interval = 0
"#;
    let config = Config::from_toml_str(toml_str).unwrap();
    let issues = config.validate();
    assert!(issues.iter().any(|i| i.severity == ConfigSeverity::Error
        && i.field == "checkpoint.checkpoint_token_interval"));
    assert!(config.validated().is_err());
}

#[test]
fn threshold_out_of_range_is_an_error() {
    let mut config = Config::default();
    config.session.context_warning_threshold = 1.5;
    assert!(config
        .validate()
        .iter()
        .any(|i| i.field == "session.context_warning_threshold"));
}

#[test]
fn short_liveness_is_only_a_warning() {
    let mut config = Config::default();
    config.transport.liveness_timeout_ms = config.transport.heartbeat_interval_ms;
    let issues = config.validate();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    assert!(config.validated().is_ok());
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[session]\nidle_timeout_secs = 30").unwrap();
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.session.idle_timeout_secs, 30);
}

#[test]
fn garbage_toml_is_a_config_error() {
    let err = Config::from_toml_str("[session\nbroken").unwrap_err();
    assert!(err.to_string().starts_with("config:"));
}
