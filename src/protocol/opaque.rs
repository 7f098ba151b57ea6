//! # Opaque Object Codec
//!
//! `Content::AnyObject` carries a value encoded by something other than the
//! field-by-field protocol codec. The encoding is pluggable through
//! [`OpaqueCodec`]; [`BincodeCodec`] is the stock implementation.
//!
//! Opaque bytes are not versioned. Peers must agree on the codec and on the
//! Rust type being carried; nothing guarantees compatibility across releases.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;
use crate::protocol::response::Content;

/// Encodes values into opaque bytes and back.
pub trait OpaqueCodec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Wrap `value` as response content.
    fn to_content<T: Serialize>(&self, value: &T) -> Result<Content> {
        Ok(Content::AnyObject(self.encode(value)?))
    }

    /// Read `content` back as `T`. `Ok(None)` for empty content or any
    /// content that is not an opaque object.
    fn from_content<T: DeserializeOwned>(&self, content: &Content) -> Result<Option<T>> {
        match content {
            Content::AnyObject(bytes) => self.decode(bytes).map(Some),
            _ => Ok(None),
        }
    }
}

/// [`OpaqueCodec`] backed by bincode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl OpaqueCodec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}
