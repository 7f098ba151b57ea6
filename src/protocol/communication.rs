//! # Communication Protocol
//!
//! The four entry points the transport and the client/server layers use to
//! turn messages into bytes and back. Each call builds a fresh single-use
//! [`Serializer`] or [`Deserializer`], so the façade itself is stateless and
//! freely shareable across threads.
//!
//! ```rust
//! use ringmaster_protocol::protocol::communication::RingMasterCommunicationProtocol;
//! use ringmaster_protocol::protocol::request::{Request, RequestCall};
//!
//! let protocol = RingMasterCommunicationProtocol::new();
//! let call = RequestCall::new(1, Request::sync("/"));
//! let bytes = protocol.serialize_request(&call, 25).unwrap();
//! assert_eq!(protocol.deserialize_request(&bytes, 25).unwrap(), call);
//! ```

use bytes::Bytes;
use tracing::instrument;

use crate::core::version;
use crate::error::Result;
use crate::protocol::deserializer::Deserializer;
use crate::protocol::request::RequestCall;
use crate::protocol::response::RequestResponse;
use crate::protocol::serializer::Serializer;

#[derive(Debug, Clone, Copy, Default)]
pub struct RingMasterCommunicationProtocol;

impl RingMasterCommunicationProtocol {
    pub const MINIMUM_SUPPORTED_VERSION: u32 = version::MINIMUM_SUPPORTED_VERSION;
    pub const MAXIMUM_SUPPORTED_VERSION: u32 = version::MAXIMUM_SUPPORTED_VERSION;

    pub fn new() -> Self {
        Self
    }

    #[instrument(level = "trace", skip_all, fields(version = version, call_id = call.call_id))]
    pub fn serialize_request(&self, call: &RequestCall, version: u32) -> Result<Bytes> {
        Serializer::new(version)?.serialize_request(call)
    }

    #[instrument(level = "trace", skip_all, fields(version = version, call_id = response.call_id))]
    pub fn serialize_response(&self, response: RequestResponse, version: u32) -> Result<Bytes> {
        Serializer::new(version)?.serialize_response(response)
    }

    #[instrument(level = "trace", skip_all, fields(version = version, len = bytes.len()))]
    pub fn deserialize_request(&self, bytes: &[u8], version: u32) -> Result<RequestCall> {
        Deserializer::new(bytes, version)?.deserialize_request()
    }

    #[instrument(level = "trace", skip_all, fields(version = version, len = bytes.len()))]
    pub fn deserialize_response(&self, bytes: &[u8], version: u32) -> Result<RequestResponse> {
        Deserializer::new(bytes, version)?.deserialize_response()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::{Arc, Mutex};

    use tracing::span::{Attributes, Id};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;
    use crate::protocol::request::Request;
    use crate::protocol::response::Content;

    #[derive(Clone, Default)]
    struct SpanNames(Arc<Mutex<Vec<&'static str>>>);

    impl<S: Subscriber> Layer<S> for SpanNames {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(attrs.metadata().name());
        }
    }

    #[test]
    fn test_entry_points_open_spans() {
        let names = SpanNames::default();
        let subscriber = tracing_subscriber::registry().with(names.clone());
        let protocol = RingMasterCommunicationProtocol::new();

        tracing::subscriber::with_default(subscriber, || {
            let call = RequestCall::new(9, Request::sync("/"));
            let bytes = protocol.serialize_request(&call, 25).unwrap();
            protocol.deserialize_request(&bytes, 25).unwrap();

            let response = RequestResponse::ok(9, Content::Empty);
            let bytes = protocol.serialize_response(response, 25).unwrap();
            protocol.deserialize_response(&bytes, 25).unwrap();
        });

        let names = names.0.lock().unwrap();
        for entry in [
            "serialize_request",
            "deserialize_request",
            "serialize_response",
            "deserialize_response",
        ] {
            assert!(names.contains(&entry), "missing span {entry}: {names:?}");
        }
    }
}
