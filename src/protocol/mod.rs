//! # RingMaster Protocol
//!
//! Message model and versioned binary codec.
//!
//! ## Components
//! - **Types / Request / Response**: the closed message model
//! - **Serializer / Deserializer**: single-use codecs bound to one version
//! - **Communication**: the four-entry-point façade over both
//! - **Opaque**: pluggable codec for `AnyObject` content
//! - **Dispatcher / Watcher**: collaborator interfaces for request handling
//!   and watch notifications
//! - **Client / Server**: request/response sessions over the secure transport
//!
//! ## Message Wire Format
//! ```text
//! Call:     [0xbeef0101: u32] [CallId: u64] [Request]
//! Response: [0xbeef0102: u32] [CallId: u64] [ResultCode: i32] [Path?] [Stat?] [ContentType: u8] [Content]
//! ```

pub mod client;
pub mod communication;
pub mod deserializer;
pub mod dispatcher;
pub mod opaque;
pub mod request;
pub mod response;
pub mod serializer;
pub mod server;
pub mod types;
pub mod watcher;

pub use client::{RequestOptions, RingMasterRequestHandler};
pub use communication::RingMasterCommunicationProtocol;
pub use server::{RingMasterServer, Session};
