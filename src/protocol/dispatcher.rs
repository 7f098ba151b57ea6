//! # Request Dispatch
//!
//! Routes decoded [`RequestCall`]s to handlers registered per
//! [`RingMasterRequestType`]. The dispatcher is also the stock
//! [`RequestHandler`], the collaborator interface a server hands requests to.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::{self, BoxFuture};
use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::request::{RequestCall, RingMasterRequestType};
use crate::protocol::response::{RequestResponse, RingMasterResultCode};

type HandlerFn = dyn Fn(&RequestCall) -> Result<RequestResponse> + Send + Sync + 'static;

/// Something that turns a request into a response, possibly asynchronously.
pub trait RequestHandler: Send + Sync {
    fn send(&self, call: RequestCall) -> BoxFuture<'static, Result<RequestResponse>>;
}

/// Request dispatcher keyed by request type.
///
/// Cloning is cheap and clones share the handler table.
#[derive(Clone)]
pub struct RequestDispatcher {
    handlers: Arc<RwLock<HashMap<RingMasterRequestType, Box<HandlerFn>>>>,
}

impl Default for RequestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `handler` for `request_type`, replacing any previous one.
    pub fn register<F>(&self, request_type: RingMasterRequestType, handler: F) -> Result<()>
    where
        F: Fn(&RequestCall) -> Result<RequestResponse> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(request_type, Box::new(handler));
        Ok(())
    }

    pub fn is_registered(&self, request_type: RingMasterRequestType) -> Result<bool> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;
        Ok(handlers.contains_key(&request_type))
    }

    /// Run the handler for `call`.
    ///
    /// The response always echoes `call.call_id`. A request type without a
    /// handler yields an `Unimplemented` response rather than an error.
    pub fn dispatch(&self, call: &RequestCall) -> Result<RequestResponse> {
        let request_type = call.request.request_type();

        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;

        let Some(handler) = handlers.get(&request_type) else {
            warn!(call_id = call.call_id, ?request_type, "No handler registered");
            return Ok(RequestResponse::new(
                call.call_id,
                RingMasterResultCode::Unimplemented,
            ));
        };

        debug!(call_id = call.call_id, ?request_type, path = %call.request.path, "Dispatching request");
        let mut response = handler(call)?;
        response.call_id = call.call_id;
        Ok(response)
    }
}

impl RequestHandler for RequestDispatcher {
    fn send(&self, call: RequestCall) -> BoxFuture<'static, Result<RequestResponse>> {
        Box::pin(future::ready(self.dispatch(&call)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::protocol::request::Request;
    use crate::protocol::response::Content;

    #[test]
    fn test_registered_handler_answers_with_call_id() {
        let dispatcher = RequestDispatcher::new();
        dispatcher
            .register(RingMasterRequestType::Sync, |call| {
                Ok(RequestResponse::ok(0, Content::String(call.request.path.clone())))
            })
            .unwrap();

        let response = dispatcher
            .dispatch(&RequestCall::new(42, Request::sync("/echo")))
            .unwrap();
        assert_eq!(response.call_id, 42);
        assert_eq!(response.content, Content::String("/echo".into()));
    }

    #[test]
    fn test_unregistered_type_is_unimplemented() {
        let dispatcher = RequestDispatcher::default();
        let response = dispatcher
            .dispatch(&RequestCall::new(7, Request::exists("/x", None)))
            .unwrap();
        assert_eq!(response.call_id, 7);
        assert_eq!(response.code(), Some(RingMasterResultCode::Unimplemented));
        assert!(!dispatcher.is_registered(RingMasterRequestType::Exists).unwrap());
    }

    #[tokio::test]
    async fn test_dispatcher_as_request_handler() {
        let dispatcher = RequestDispatcher::new();
        dispatcher
            .register(RingMasterRequestType::Check, |_| {
                Ok(RequestResponse::new(0, RingMasterResultCode::BadVersion))
            })
            .unwrap();
        let handler: Arc<dyn RequestHandler> = Arc::new(dispatcher);
        let response = handler
            .send(RequestCall::new(3, Request::check("/c", 1)))
            .await
            .unwrap();
        assert_eq!(response.code(), Some(RingMasterResultCode::BadVersion));
        assert_eq!(response.call_id, 3);
    }
}
