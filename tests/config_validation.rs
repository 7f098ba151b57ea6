//! Integration tests for configuration loading and validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use ringmaster_protocol::config::{NetworkConfig, ENV_PREFIX};
use ringmaster_protocol::transport::{SecurityPolicy, TlsIdentity, TransportOptions};
use ringmaster_protocol::ProtocolError;
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_protocol_version_out_of_range() {
    for version in [12, 26] {
        let config = NetworkConfig::default_with_overrides(|c| c.protocol.version = version);
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("outside supported range")));
    }
}

#[test]
fn test_max_packet_size_bounds() {
    let small = NetworkConfig::default_with_overrides(|c| c.protocol.max_packet_size = 100);
    assert!(small.validate().iter().any(|e| e.contains("too small")));

    let large = NetworkConfig::default_with_overrides(|c| {
        c.protocol.max_packet_size = i32::MAX as usize + 1
    });
    assert!(large.validate().iter().any(|e| e.contains("too large")));
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid server address")));

    config.server.address = String::new();
    assert!(config.validate().iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_invalid_client_endpoints() {
    let mut config = NetworkConfig::default();
    config.client.endpoints = "10.0.0.1:9000, nope".to_string();
    let errors = config.validate();
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert!(errors[0].contains("'nope'"));

    config.client.endpoints = " ; ".to_string();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("endpoints cannot be empty")));
}

#[test]
fn test_client_request_settings() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.client.request_timeout = Duration::from_millis(5);
        c.client.heartbeat_interval = Duration::from_millis(1);
        c.client.max_retries = 11;
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Request timeout too short")), "{errors:?}");
    assert!(errors.iter().any(|e| e.contains("Heartbeat interval")), "{errors:?}");
    assert!(errors.iter().any(|e| e.contains("Too many retries")), "{errors:?}");
}

#[test]
fn test_zero_transport_limits() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.transport.send_queue_length = 0;
        c.transport.max_unflushed_packets = 0;
        c.transport.max_connection_idle_time = Duration::ZERO;
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Send queue length")));
    assert!(errors.iter().any(|e| e.contains("unflushed")));
    assert!(errors.iter().any(|e| e.contains("idle time")));
}

#[test]
fn test_authentication_timeout_bounds() {
    let short = NetworkConfig::default_with_overrides(|c| {
        c.transport.authentication_timeout = Duration::from_millis(10)
    });
    assert!(short.validate().iter().any(|e| e.contains("too short")));
}

#[test]
fn test_multiple_errors_reported_together() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = String::new();
        c.server.max_connections = 0;
        c.logging.app_name = String::new();
    });
    assert!(config.validate().len() >= 3);

    let err = config.validate_strict().unwrap_err();
    let ProtocolError::ConfigError(message) = err else {
        panic!("expected ConfigError");
    };
    assert!(message.contains("Configuration validation failed"));
}

#[test]
fn test_logging_requires_an_output() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.logging.log_to_console = false;
        c.logging.log_to_file = false;
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

// ============================================================================
// TLS settings
// ============================================================================

#[test]
fn test_tls_enabled_without_files() {
    let config = NetworkConfig::default_with_overrides(|c| c.tls.enabled = true);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("cert_path and key_path")));
    assert!(matches!(
        TransportOptions::from_config(&config),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_bad_thumbprints_rejected() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.tls.enabled = true;
        c.tls.cert_path = Some("/nonexistent/cert.pem".into());
        c.tls.key_path = Some("/nonexistent/key.pem".into());
        c.tls.accepted_thumbprints = vec!["abc".into(), "A".repeat(64)];
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("TLS file does not exist")));
    assert_eq!(
        errors
            .iter()
            .filter(|e| e.contains("Invalid SHA-256 thumbprint"))
            .count(),
        1
    );
}

#[test]
fn test_tls_config_builds_security_policy() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    let identity = TlsIdentity::generate_self_signed_files(&cert, &key, &["localhost"]).unwrap();

    let config = NetworkConfig::default_with_overrides(|c| {
        c.tls.enabled = true;
        c.tls.cert_path = Some(cert.to_string_lossy().into_owned());
        c.tls.key_path = Some(key.to_string_lossy().into_owned());
        c.tls.accepted_thumbprints = vec![identity.thumbprint().to_lowercase()];
    });
    assert!(config.validate().is_empty(), "{:?}", config.validate());

    let options = TransportOptions::from_config(&config).unwrap();
    assert!(options.security.is_tls());
    assert!(matches!(
        SecurityPolicy::from_config(&NetworkConfig::default().tls).unwrap(),
        SecurityPolicy::Plain
    ));
}

// ============================================================================
// Files and environment
// ============================================================================

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ringmaster.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.protocol.version = 21;
        c.server.address = "0.0.0.0:7000".into();
        c.client.reconnect_delay = Duration::from_millis(250);
        c.logging.log_level = Level::DEBUG;
    });
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.protocol.version, 21);
    assert_eq!(loaded.server.address, "0.0.0.0:7000");
    assert_eq!(loaded.client.reconnect_delay, Duration::from_millis(250));
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_missing_file_and_bad_toml() {
    assert!(matches!(
        NetworkConfig::from_file("/definitely/not/here.toml"),
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(matches!(
        NetworkConfig::from_toml("protocol = 5"),
        Err(ProtocolError::ConfigError(_))
    ));
}

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with(ENV_PREFIX) {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_env_overrides() {
    clear_env();
    std::env::set_var("RINGMASTER_PROTOCOL_VERSION", "18");
    std::env::set_var("RINGMASTER_SERVER_ADDRESS", "127.0.0.1:1234");
    std::env::set_var("RINGMASTER_RECONNECT_DELAY_MS", "75");
    std::env::set_var("RINGMASTER_REQUEST_TIMEOUT_MS", "1500");
    std::env::set_var("RINGMASTER_TLS_ACCEPTED_THUMBPRINTS", "aa; bb ,cc");
    std::env::set_var("RINGMASTER_LOG_LEVEL", "warn");

    let config = NetworkConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.protocol.version, 18);
    assert_eq!(config.server.address, "127.0.0.1:1234");
    assert_eq!(config.client.reconnect_delay, Duration::from_millis(75));
    assert_eq!(config.client.request_timeout, Duration::from_millis(1500));
    assert_eq!(config.tls.accepted_thumbprints, vec!["aa", "bb", "cc"]);
    assert_eq!(config.logging.log_level, Level::WARN);
}

#[test]
#[serial]
fn test_env_value_that_does_not_parse() {
    clear_env();
    std::env::set_var("RINGMASTER_MAX_CONNECTIONS", "lots");
    let result = NetworkConfig::from_env();
    clear_env();

    let Err(ProtocolError::ConfigError(message)) = result else {
        panic!("expected ConfigError");
    };
    assert!(message.contains("RINGMASTER_MAX_CONNECTIONS"));
}
