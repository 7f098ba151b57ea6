//! # Transport Layer
//!
//! Length-prefixed packet transport with optional mutual TLS.
//!
//! ## Components
//! - **Secure**: server/client lifecycle, accept and reconnect loops,
//!   protocol version negotiation
//! - **Connection**: bounded send queue, framed reader/writer, lifespan and
//!   idle enforcement
//! - **TLS**: identities, certificate selection and validation, cancellable
//!   authentication

pub mod connection;
pub mod secure;
pub mod tls;

pub use connection::{Connection, PacketHandler};
pub use secure::{parse_connection_string, SecureTransport, TransportOptions};
pub use tls::{
    CertificateSelector, CertificateValidator, SecurityPolicy, ThumbprintValidator, TlsIdentity,
    TlsSettings,
};
