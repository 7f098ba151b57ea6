//! # Error Types
//!
//! Error handling for the RingMaster wire protocol and its secure transport.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! the single [`ProtocolError`] enum defined here.
//!
//! ## Error Categories
//! - **Codec Errors**: malformed byte streams, unknown discriminants, version
//!   violations. Always fatal to the one message being processed.
//! - **Transport Errors**: lifecycle misuse (`NotStarted`, `AlreadyStarted`),
//!   connection failures, full send queues.
//! - **Authentication Errors**: TLS handshakes that timed out, were cancelled,
//!   or presented an untrusted certificate chain.
//! - **I/O and Configuration Errors**: socket, file, and config parsing failures.
//!
//! ## Example Usage
//! ```rust
//! use ringmaster_protocol::error::{ProtocolError, Result};
//! use ringmaster_protocol::core::version::ProtocolVersion;
//!
//! fn pick(version: u32) -> Result<ProtocolVersion> {
//!     ProtocolVersion::new(version)
//! }
//!
//! assert!(matches!(pick(12), Err(ProtocolError::VersionOutOfRange(12))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_WATCHERS_LOCK: &str = "Failed to acquire lock on watcher registry";

    /// Client and server session errors
    pub const ERR_PENDING_LOCK: &str = "Failed to acquire lock on pending requests";
    pub const ERR_SESSIONS_LOCK: &str = "Failed to acquire lock on session table";

    /// Codec errors
    pub const ERR_BUFFER_UNDERRUN: &str = "Unexpected end of buffer";
    pub const ERR_NOT_A_REQUEST: &str = "Not a request call";
    pub const ERR_NOT_A_RESPONSE: &str = "Not a request response";
    pub const ERR_BAD_STRING_LENGTH: &str = "Malformed 7-bit encoded string length";
    pub const ERR_INVALID_UTF8: &str = "String is not valid UTF-8";
    pub const ERR_NEGATIVE_LENGTH: &str = "Negative length prefix";
    pub const ERR_NULL_ACL_ENTRY: &str = "Null entry in ACL list";

    /// Connection errors
    pub const ERR_NO_ENDPOINTS: &str = "No endpoints to connect to";
    pub const ERR_NO_SERVER_CERTIFICATE: &str = "No server certificate configured";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Primary error type for all protocol and transport operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Opaque object codec error: {0}")]
    Opaque(#[from] bincode::Error),

    /// Malformed byte stream: bad magic, truncated buffer, bad length prefix.
    #[error("Format error: {0}")]
    Format(String),

    #[error("Protocol version {0} is outside the supported range")]
    VersionOutOfRange(u32),

    /// A feature was used below the version that introduced it.
    #[error("{feature} is not supported by protocol version {version}")]
    UnsupportedFeature { feature: &'static str, version: u32 },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A discriminant outside its closed set.
    #[error("Unknown {kind} value {value}")]
    UnknownType { kind: &'static str, value: i64 },

    #[error("Transport has not been started")]
    NotStarted,

    #[error("Transport has already been started")]
    AlreadyStarted,

    #[error("Transport start timed out")]
    StartTimedOut,

    #[error("Transport stop timed out")]
    StopTimedOut,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send queue is full")]
    SendQueueFull,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Authentication timed out")]
    AuthenticationTimedOut,

    #[error("Authentication cancelled")]
    AuthenticationCancelled,

    #[error("Certificate trust validation failed: {0}")]
    TrustValidationFailed(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),

    #[error("TLS error: {0}")]
    TlsError(String),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::Format`] built from a static message.
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        ProtocolError::Format(msg.into())
    }

    /// Shorthand for a [`ProtocolError::UnknownType`].
    pub(crate) fn unknown(kind: &'static str, value: impl Into<i64>) -> Self {
        ProtocolError::UnknownType {
            kind,
            value: value.into(),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
