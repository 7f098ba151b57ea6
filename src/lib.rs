//! # RingMaster Protocol
//!
//! Versioned binary wire protocol and secure transport for RingMaster
//! clients and servers.
//!
//! ## Layers
//! - [`core`]: wire primitives, the versioned field policy, packet framing
//! - [`protocol`]: the request/response model and the version-aware
//!   serializer and deserializer (versions 13 through 25), plus the client
//!   request handler and server sessions built on the transport
//! - [`transport`]: TCP server/client lifecycle with mutual TLS, protocol
//!   version negotiation, bounded send queues and connection limits
//! - [`cache`]: prefix-partitioned LRU cache for client-side node data
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, timeouts
//!
//! ## Example
//! ```rust
//! use ringmaster_protocol::protocol::request::{Request, RequestCall};
//! use ringmaster_protocol::protocol::RingMasterCommunicationProtocol;
//!
//! let protocol = RingMasterCommunicationProtocol::new();
//! let call = RequestCall::new(7, Request::sync("/services"));
//! let bytes = protocol.serialize_request(&call, 19).unwrap();
//! assert_eq!(protocol.deserialize_request(&bytes, 19).unwrap(), call);
//! ```

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
