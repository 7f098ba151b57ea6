//! # Packet Codec
//!
//! Length-prefixed framing used by the secure transport.
//!
//! ```text
//! [Length: i32] [Payload: Length bytes]
//! ```
//!
//! The length is little-endian unless the codec is built with
//! [`PacketCodec::with_network_byte_order`]. Negative lengths and lengths above
//! the configured maximum are rejected before any allocation happens.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// Default upper bound on a single packet.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
    network_byte_order: bool,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            network_byte_order: false,
        }
    }

    /// Write and read the length prefix big-endian.
    pub fn with_network_byte_order(mut self, enabled: bool) -> Self {
        self.network_byte_order = enabled;
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn peek_length(&self, src: &[u8]) -> i32 {
        let raw = [src[0], src[1], src[2], src[3]];
        if self.network_byte_order {
            i32::from_be_bytes(raw)
        } else {
            i32::from_le_bytes(raw)
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = self.peek_length(src);
        let length = usize::try_from(length)
            .map_err(|_| ProtocolError::Format(format!("Negative packet length {length}")))?;
        if length > self.max_packet_size {
            return Err(ProtocolError::OversizedPacket(length));
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_packet_size {
            return Err(ProtocolError::OversizedPacket(item.len()));
        }
        dst.reserve(LENGTH_PREFIX + item.len());
        let len = item.len() as i32;
        if self.network_byte_order {
            dst.put_i32(len);
        } else {
            dst.put_i32_le(len);
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}
