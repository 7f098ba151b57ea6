#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use ringmaster_protocol::core::codec::PacketCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = PacketCodec::new(64 * 1024).with_network_byte_order(data.first() == Some(&1));
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_frame)) = codec.decode(&mut buf) {}
});
