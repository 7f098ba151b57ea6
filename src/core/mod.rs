//! # Core Protocol Components
//!
//! Low-level byte handling shared by the protocol and the transport.
//!
//! ## Components
//! - **Primitives**: little-endian fixed-width values, 7-bit length-prefixed
//!   strings, null-flagged byte buffers and GUIDs
//! - **Version**: the versioned field policy, one table for every gated field
//! - **Codec**: Tokio codec for length-prefixed packet framing
//!
//! ## Message Wire Format
//! ```text
//! [Magic: u32] [CallId: u64] [Body...]
//! ```
//! `0xbeef0101` marks a request call, `0xbeef0102` a response.
//!
//! ## Limits
//! - Maximum packet size: 16MB by default
//! - Lengths and counts are checked against the remaining input before allocating

pub mod codec;
pub mod primitives;
pub mod version;
