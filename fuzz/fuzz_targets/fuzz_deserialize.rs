#![no_main]

use libfuzzer_sys::fuzz_target;
use ringmaster_protocol::protocol::RingMasterCommunicationProtocol;

fuzz_target!(|data: &[u8]| {
    // First byte picks the version, the rest is the message.
    let Some((&selector, message)) = data.split_first() else {
        return;
    };
    let version = 13 + u32::from(selector % 13);
    let protocol = RingMasterCommunicationProtocol::new();

    if let Ok(call) = protocol.deserialize_request(message, version) {
        // Re-encoding decoded input must not panic.
        let _ = protocol.serialize_request(&call, version);
    }
    if let Ok(response) = protocol.deserialize_response(message, version) {
        let _ = protocol.serialize_response(response, version);
    }
});
