//! # Configuration Management
//!
//! Centralized configuration for the RingMaster protocol and its secure
//! transport.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - Direct instantiation with defaults
//! - Environment overrides (`RINGMASTER_*`) via [`NetworkConfig::from_env`]
//!
//! Durations are written as integer milliseconds in TOML.
//!
//! ## Example
//! ```toml
//! [protocol]
//! version = 25
//!
//! [server]
//! address = "0.0.0.0:99"
//!
//! [tls]
//! enabled = true
//! cert_path = "/etc/ringmaster/server.pem"
//! key_path = "/etc/ringmaster/server.key"
//! accepted_thumbprints = ["5F1C..."]
//! ```

use crate::core::codec::MAX_PACKET_SIZE;
use crate::core::version::{MAXIMUM_SUPPORTED_VERSION, MINIMUM_SUPPORTED_VERSION};
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Prefix of every environment variable read by [`NetworkConfig::from_env`].
pub const ENV_PREFIX: &str = "RINGMASTER_";

/// Default size of the socket send and receive buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default number of packets a connection may queue for sending.
pub const DEFAULT_SEND_QUEUE_LENGTH: usize = 10_000;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Read a TOML file; sections it omits keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid TOML configuration: {e}")))
    }

    /// Defaults overridden by any `RINGMASTER_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields of `self` from `RINGMASTER_*` variables.
    ///
    /// A variable that is set but does not parse is an error.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(version) = env_parse::<u32>("PROTOCOL_VERSION")? {
            self.protocol.version = version;
        }
        if let Some(enabled) = env_parse::<bool>("NETWORK_BYTE_ORDER")? {
            self.protocol.use_network_byte_order = enabled;
        }
        if let Some(address) = env_var("SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(max) = env_parse::<usize>("MAX_CONNECTIONS")? {
            self.server.max_connections = max;
        }
        if let Some(endpoints) = env_var("CLIENT_ENDPOINTS") {
            self.client.endpoints = endpoints;
        }
        if let Some(ms) = env_parse::<u64>("RECONNECT_DELAY_MS")? {
            self.client.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("REQUEST_TIMEOUT_MS")? {
            self.client.request_timeout = Duration::from_millis(ms);
        }
        if let Some(len) = env_parse::<usize>("SEND_QUEUE_LENGTH")? {
            self.transport.send_queue_length = len;
        }
        if let Some(ms) = env_parse::<u64>("AUTHENTICATION_TIMEOUT_MS")? {
            self.transport.authentication_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("MAX_CONNECTION_IDLE_TIME_MS")? {
            self.transport.max_connection_idle_time = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("MAX_CONNECTION_LIFESPAN_MS")? {
            self.transport.max_connection_lifespan = Duration::from_millis(ms);
        }
        if let Some(enabled) = env_parse::<bool>("TLS_ENABLED")? {
            self.tls.enabled = enabled;
        }
        if let Some(path) = env_var("TLS_CERT_PATH") {
            self.tls.cert_path = Some(path);
        }
        if let Some(path) = env_var("TLS_KEY_PATH") {
            self.tls.key_path = Some(path);
        }
        if let Some(list) = env_var("TLS_ACCEPTED_THUMBPRINTS") {
            self.tls.accepted_thumbprints = split_list(&list);
        }
        if let Some(level) = env_var("LOG_LEVEL") {
            self.logging.log_level = Level::from_str(&level).map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid {ENV_PREFIX}LOG_LEVEL: {level}"))
            })?;
        }
        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML.
    pub fn example_config() -> String {
        Self::default()
            .to_toml()
            .unwrap_or_else(|e| format!("# default configuration unavailable: {e}"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot render configuration: {e}")))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot write {}: {e}", path.display()))
        })
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.protocol.validate());
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.tls.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// [`Self::validate`] folded into a single `ConfigError`.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ProtocolError::ConfigError(format!("Invalid {ENV_PREFIX}{name}: '{raw}'"))
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Wire protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Wire-format version offered during negotiation
    pub version: u32,

    /// Write packet length prefixes big-endian
    #[serde(default)]
    pub use_network_byte_order: bool,

    /// Largest packet accepted from or sent to a peer
    pub max_packet_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: MAXIMUM_SUPPORTED_VERSION,
            use_network_byte_order: false,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !(MINIMUM_SUPPORTED_VERSION..=MAXIMUM_SUPPORTED_VERSION).contains(&self.version) {
            errors.push(format!(
                "Protocol version {} outside supported range {}..={}",
                self.version, MINIMUM_SUPPORTED_VERSION, MAXIMUM_SUPPORTED_VERSION
            ));
        }

        if self.max_packet_size < 1024 {
            errors.push("Max packet size too small (minimum: 1 KB)".to_string());
        } else if self.max_packet_size > i32::MAX as usize {
            errors.push(format!(
                "Max packet size too large: {} bytes (length prefix is an i32)",
                self.max_packet_size
            ));
        }

        errors
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Timeout for binding the listener
    #[serde(with = "duration_serde")]
    pub start_timeout: Duration,

    /// Timeout for stopping the accept or connect loop
    #[serde(with = "duration_serde")]
    pub stop_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_connections: 1000,
            start_timeout: timeout::START_TIMEOUT,
            stop_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.start_timeout.as_millis() < 100 {
            errors.push("Start timeout too short (minimum: 100ms)".to_string());
        }

        if self.stop_timeout.as_millis() < 100 {
            errors.push("Stop timeout too short (minimum: 100ms)".to_string());
        } else if self.stop_timeout.as_secs() > 60 {
            errors.push("Stop timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Candidate servers as `host:port` entries separated by `,` or `;`
    pub endpoints: String,

    /// Timeout for each connection attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Time a request may wait for its response
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Quiet time on a connection after which a heartbeat is sent
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Extra attempts for requests failing with a retriable code
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: String::from("127.0.0.1:9000"),
            connect_timeout: timeout::START_TIMEOUT,
            reconnect_delay: timeout::RECONNECT_DELAY,
            request_timeout: timeout::REQUEST_TIMEOUT,
            heartbeat_interval: timeout::HEARTBEAT_INTERVAL,
            max_retries: 2,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let entries = split_list(&self.endpoints);
        if entries.is_empty() {
            errors.push("Client endpoints cannot be empty".to_string());
        }
        for entry in entries {
            let valid = entry
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                errors.push(format!(
                    "Invalid client endpoint: '{entry}' (expected format: 'host:port')"
                ));
            }
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 60 {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if self.heartbeat_interval < self.request_timeout {
            errors.push("Heartbeat interval cannot be shorter than the request timeout".to_string());
        }

        if self.max_retries > 10 {
            errors.push("Too many retries (maximum: 10)".to_string());
        }

        errors
    }
}

/// Per-connection transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Connections older than this are disconnected
    #[serde(with = "duration_serde")]
    pub max_connection_lifespan: Duration,

    /// Connections that received nothing for this long are disconnected
    #[serde(with = "duration_serde")]
    pub max_connection_idle_time: Duration,

    pub send_buffer_size: usize,

    pub receive_buffer_size: usize,

    /// Packets that may wait in a connection's send queue
    pub send_queue_length: usize,

    /// Packets written before the stream is flushed
    pub max_unflushed_packets: usize,

    /// Bound on the TLS handshake and version negotiation
    #[serde(with = "duration_serde")]
    pub authentication_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connection_lifespan: timeout::MAX_CONNECTION_LIFESPAN,
            max_connection_idle_time: timeout::MAX_CONNECTION_LIFESPAN,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            send_queue_length: DEFAULT_SEND_QUEUE_LENGTH,
            max_unflushed_packets: DEFAULT_SEND_QUEUE_LENGTH,
            authentication_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connection_lifespan.is_zero() {
            errors.push("Max connection lifespan cannot be 0".to_string());
        }
        if self.max_connection_idle_time.is_zero() {
            errors.push("Max connection idle time cannot be 0".to_string());
        }

        if self.send_buffer_size < 512 || self.receive_buffer_size < 512 {
            errors.push("Socket buffer sizes too small (minimum: 512 bytes)".to_string());
        }

        if self.send_queue_length == 0 {
            errors.push("Send queue length must be greater than 0".to_string());
        } else if self.send_queue_length > 1_000_000 {
            errors.push(format!(
                "Send queue length too large: {} (max recommended: 1,000,000)",
                self.send_queue_length
            ));
        }

        if self.max_unflushed_packets == 0 {
            errors.push("Max unflushed packets must be greater than 0".to_string());
        }

        if self.authentication_timeout.as_millis() < 100 {
            errors.push("Authentication timeout too short (minimum: 100ms)".to_string());
        } else if self.authentication_timeout.as_secs() > 300 {
            errors.push("Authentication timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Mutual TLS settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Secure connections with TLS; plain TCP otherwise
    pub enabled: bool,

    /// PEM certificate chain of the local identity
    pub cert_path: Option<String>,

    /// PEM PKCS#8 private key of the local identity
    pub key_path: Option<String>,

    /// SHA-256 thumbprints (hex) of peer certificates to trust
    #[serde(default)]
    pub accepted_thumbprints: Vec<String>,

    /// SHA-256 thumbprints (hex) that are never trusted
    #[serde(default)]
    pub blacklisted_thumbprints: Vec<String>,

    /// Servers demand a client certificate
    pub require_client_certificate: bool,

    /// Name presented by clients during the handshake
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            accepted_thumbprints: Vec::new(),
            blacklisted_thumbprints: Vec::new(),
            require_client_certificate: true,
            server_name: None,
        }
    }
}

impl TlsConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.enabled {
            return errors;
        }

        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => {
                for path in [cert, key] {
                    if !Path::new(path).exists() {
                        errors.push(format!("TLS file does not exist: {path}"));
                    }
                }
            }
            _ => errors.push("cert_path and key_path must be set when TLS is enabled".to_string()),
        }

        for thumbprint in self
            .accepted_thumbprints
            .iter()
            .chain(&self.blacklisted_thumbprints)
        {
            let digits: String = thumbprint
                .chars()
                .filter(|c| !matches!(c, ':' | ' '))
                .collect();
            if digits.len() != 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
                errors.push(format!("Invalid SHA-256 thumbprint: '{thumbprint}'"));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Recorded on the first event after the subscriber is installed
    pub app_name: String,

    /// Default filter level; `RUST_LOG` wins when set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Appended to; required when `log_to_file` is set
    pub log_file_path: Option<String>,

    /// Emit JSON lines instead of the human-readable format
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("ringmaster-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Levels as lowercase names
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Level::from_str(&raw).map_err(|_| serde::de::Error::custom(format!("unknown level '{raw}'")))
    }
}
