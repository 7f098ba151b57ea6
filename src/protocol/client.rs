//! # Client Request Handler
//!
//! Sends requests over a client-mode [`SecureTransport`] and matches every
//! decoded [`RequestResponse`] to its call by call id.
//!
//! ```text
//! request ──▶ wait for an initialized connection ──▶ register call id ──▶ send
//!                                                                          │
//! response ◀── pending[call_id] ◀── deserialize at connection version ◀───┘
//! ```
//!
//! - Each new connection carries an Init request before any other traffic
//! - A request without a response after `request_timeout` completes with
//!   `OperationTimeout`
//! - Losing the connection completes every pending request with
//!   `ConnectionLoss` and drains the watchers
//! - Retriable codes are retried up to `max_retries` times
//! - A connection quiet for `heartbeat_interval` gets a heartbeat Exists
//!   request; a failed heartbeat drops the connection
//! - Responses carrying [`WATCHER_CALL_ID`] are watcher notifications and go
//!   to the [`WatcherRegistry`]

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::communication::RingMasterCommunicationProtocol;
use crate::protocol::dispatcher::RequestHandler;
use crate::protocol::request::{Request, RequestCall};
use crate::protocol::response::{Content, RequestResponse, RingMasterResultCode};
use crate::protocol::watcher::WatcherRegistry;
use crate::transport::{Connection, SecureTransport};

/// Call id of server-initiated messages, which carry watcher notifications.
pub const WATCHER_CALL_ID: u64 = u64::MAX;

/// Heartbeats ask whether this path exists. It never does.
const HEARTBEAT_PATH: &str = "<Fail>";

/// Timing and retry settings of a [`RingMasterRequestHandler`].
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

impl RequestOptions {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            request_timeout: config.client.request_timeout,
            heartbeat_interval: config.client.heartbeat_interval,
            max_retries: config.client.max_retries,
            retry_delay: config.client.reconnect_delay,
        }
    }
}

struct Shared {
    protocol: RingMasterCommunicationProtocol,
    options: RequestOptions,
    next_call_id: AtomicU64,
    next_heartbeat: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<RequestResponse>>>,
    /// The connection that completed Init, if any.
    ready: watch::Sender<Option<Arc<Connection>>>,
    watchers: Arc<WatcherRegistry>,
    token: CancellationToken,
}

/// Request/response client over a [`SecureTransport`].
pub struct RingMasterRequestHandler {
    transport: SecureTransport,
    shared: Arc<Shared>,
}

impl fmt::Debug for RingMasterRequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingMasterRequestHandler")
            .field("options", &self.shared.options)
            .field("pending", &self.pending_count())
            .field("watchers", &self.shared.watchers.len())
            .finish()
    }
}

impl RingMasterRequestHandler {
    /// Take over the connection callbacks of `transport`.
    pub fn new(transport: SecureTransport, options: RequestOptions) -> Self {
        let (ready, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            protocol: RingMasterCommunicationProtocol::new(),
            options,
            next_call_id: AtomicU64::new(1),
            next_heartbeat: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            ready,
            watchers: Arc::new(WatcherRegistry::new()),
            token: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&shared);
        transport.set_on_new_connection(move |connection| {
            if let Some(shared) = weak.upgrade() {
                shared.on_new_connection(connection);
            }
        });
        let weak = Arc::downgrade(&shared);
        transport.set_on_connection_lost(move |connection| {
            if let Some(shared) = weak.upgrade() {
                shared.on_connection_lost(&connection);
            }
        });

        Self { transport, shared }
    }

    pub fn options(&self) -> &RequestOptions {
        &self.shared.options
    }

    /// Registry that receives the watcher notifications of this client.
    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.shared.watchers
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().map(|p| p.len()).unwrap_or(0)
    }

    /// Whether a connection has completed Init and is still up.
    pub fn is_connected(&self) -> bool {
        self.shared
            .ready
            .borrow()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    pub async fn start(&self, endpoints: Vec<SocketAddr>) -> Result<()> {
        self.transport.start_client(endpoints).await
    }

    pub async fn start_with(&self, connection_string: &str) -> Result<()> {
        self.transport.start_client_with(connection_string).await
    }

    /// Send `request` and wait for its response, retrying retriable codes.
    ///
    /// Failures the server reports are returned as responses; `Err` is kept
    /// for local problems such as an unserializable request or a full send
    /// queue.
    pub async fn request(&self, request: Request) -> Result<RequestResponse> {
        Arc::clone(&self.shared).request(request).await
    }

    /// Stop the transport, fail pending requests and drain watchers.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        self.shared.token.cancel();
        self.transport.close().await;
        self.shared.ready.send_replace(None);
        self.shared.fail_pending();
        if let Err(e) = self.shared.watchers.drain() {
            warn!(error = %e, "Failed to drain watchers");
        }
        info!("Request handler closed");
    }
}

impl RequestHandler for RingMasterRequestHandler {
    /// The response echoes `call.call_id`; the id used on the wire is the
    /// handler's own.
    fn send(&self, call: RequestCall) -> BoxFuture<'static, Result<RequestResponse>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let mut response = shared.request(call.request).await?;
            response.call_id = call.call_id;
            Ok(response)
        })
    }
}

impl Drop for RingMasterRequestHandler {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

impl Shared {
    fn pending(&self) -> Result<MutexGuard<'_, HashMap<u64, oneshot::Sender<RequestResponse>>>> {
        self.pending
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PENDING_LOCK.to_string()))
    }

    fn next_call_id(&self) -> u64 {
        loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            if id != WATCHER_CALL_ID && id != 0 {
                return id;
            }
        }
    }

    async fn request(self: Arc<Self>, request: Request) -> Result<RequestResponse> {
        let mut attempt = 0u32;
        loop {
            let response = match self.connection().await {
                Some(connection) => self.exchange(&connection, request.clone()).await?,
                None => RequestResponse::new(0, RingMasterResultCode::ConnectionLoss),
            };

            match response.code() {
                Some(code) if code.is_retriable() && attempt < self.options.max_retries => {
                    attempt += 1;
                    debug!(attempt, ?code, path = %request.path, "Retrying request");
                    tokio::select! {
                        _ = self.token.cancelled() => return Ok(response),
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
                _ => return Ok(response),
            }
        }
    }

    /// The initialized connection, waiting up to `request_timeout` for one.
    async fn connection(&self) -> Option<Arc<Connection>> {
        let mut ready = self.ready.subscribe();
        let wait = async {
            ready
                .wait_for(|c| c.as_ref().is_some_and(|c| c.is_connected()))
                .await
                .ok()
                .and_then(|c| Option::clone(&c))
        };

        tokio::select! {
            _ = self.token.cancelled() => None,
            found = tokio::time::timeout(self.options.request_timeout, wait) => found.ok().flatten(),
        }
    }

    /// One attempt of `request` on `connection`.
    async fn exchange(&self, connection: &Connection, request: Request) -> Result<RequestResponse> {
        let call_id = self.next_call_id();
        let (sender, receiver) = oneshot::channel();
        self.pending()?.insert(call_id, sender);

        let call = RequestCall::new(call_id, request);
        let sent = self
            .protocol
            .serialize_request(&call, connection.protocol_version())
            .and_then(|packet| {
                trace!(connection_id = connection.id(), call_id, len = packet.len(), "Sending request");
                connection.send(packet)
            });
        if let Err(e) = sent {
            self.forget(call_id);
            return match e {
                ProtocolError::ConnectionClosed => {
                    Ok(RequestResponse::new(call_id, RingMasterResultCode::ConnectionLoss))
                }
                other => Err(other),
            };
        }

        match tokio::time::timeout(self.options.request_timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Ok(RequestResponse::new(call_id, RingMasterResultCode::ConnectionLoss)),
            Err(_) => {
                self.forget(call_id);
                debug!(call_id, timeout = ?self.options.request_timeout, "Request timed out");
                Ok(RequestResponse::new(call_id, RingMasterResultCode::OperationTimeout))
            }
        }
    }

    fn forget(&self, call_id: u64) {
        if let Ok(mut pending) = self.pending() {
            pending.remove(&call_id);
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = match self.pending() {
            Ok(mut pending) => pending.drain().collect(),
            Err(e) => {
                warn!(error = %e, "Cannot fail pending requests");
                return;
            }
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing pending requests");
        }
        for (call_id, sender) in drained {
            let _ = sender.send(RequestResponse::new(call_id, RingMasterResultCode::ConnectionLoss));
        }
    }

    fn on_new_connection(self: Arc<Self>, connection: Arc<Connection>) {
        let weak: Weak<Self> = Arc::downgrade(&self);
        connection.set_packet_handler(Arc::new(move |connection: &Arc<Connection>, packet: Bytes| {
            if let Some(shared) = weak.upgrade() {
                shared.on_packet(connection, &packet);
            }
        }));
        tokio::spawn(self.manage_connection(connection));
    }

    fn on_connection_lost(&self, connection: &Connection) {
        info!(connection_id = connection.id(), "Connection lost");
        self.ready.send_if_modified(|current| {
            if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
                *current = None;
                true
            } else {
                false
            }
        });
        self.fail_pending();
        if let Err(e) = self.watchers.drain() {
            warn!(error = %e, "Failed to drain watchers");
        }
    }

    /// Init the session, publish the connection, then heartbeat it while quiet.
    #[instrument(skip_all, fields(connection_id = connection.id()))]
    async fn manage_connection(self: Arc<Self>, connection: Arc<Connection>) {
        let init = self.exchange(&connection, Request::init(0, "")).await;
        match init {
            Ok(response) if response.is_ok() => {
                info!(remote = %connection.remote_address(), "Session initialized");
            }
            Ok(response) => {
                warn!(result_code = response.result_code, "Session init rejected");
                connection.disconnect();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Session init failed");
                connection.disconnect();
                return;
            }
        }
        self.ready.send_replace(Some(Arc::clone(&connection)));

        let interval = self.options.heartbeat_interval;
        loop {
            let quiet_for = interval.saturating_sub(connection.idle_time());
            tokio::select! {
                _ = connection.closed() => break,
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(quiet_for) => {}
            }
            if connection.idle_time() < interval {
                continue;
            }
            if !self.heartbeat(&connection).await {
                warn!("Heartbeat failed");
                connection.disconnect();
                break;
            }
        }
        debug!("Connection management finished");
    }

    async fn heartbeat(&self, connection: &Connection) -> bool {
        let beat = self.next_heartbeat.fetch_add(1, Ordering::Relaxed);
        trace!(beat, "Sending heartbeat");
        let request = Request::exists(HEARTBEAT_PATH, None).with_uid(beat);
        match self.exchange(connection, request).await {
            Ok(response) => !response.code().is_some_and(|c| c.is_retriable()),
            Err(_) => false,
        }
    }

    fn on_packet(&self, connection: &Connection, packet: &[u8]) {
        let response = match self
            .protocol
            .deserialize_response(packet, connection.protocol_version())
        {
            Ok(response) => response,
            Err(e) => {
                warn!(connection_id = connection.id(), error = %e, "Invalid response packet");
                connection.disconnect();
                return;
            }
        };

        if response.call_id == WATCHER_CALL_ID {
            self.on_message_to_client(response);
            return;
        }

        let sender = self
            .pending()
            .ok()
            .and_then(|mut pending| pending.remove(&response.call_id));
        match sender {
            Some(sender) => {
                trace!(call_id = response.call_id, result_code = response.result_code, "Response received");
                let _ = sender.send(response);
            }
            None => debug!(call_id = response.call_id, "Unexpected response"),
        }
    }

    fn on_message_to_client(&self, message: RequestResponse) {
        let call = match message.content {
            Content::WatcherCall(call) => call,
            other => {
                warn!(content = ?other.content_type(), "Message to client is not a watcher call");
                return;
            }
        };
        match self.watchers.deliver(&call) {
            Ok(true) => trace!(watcher_id = call.watcher_id, "Watcher notified"),
            Ok(false) => {}
            Err(e) => warn!(watcher_id = call.watcher_id, error = %e, "Watcher delivery failed"),
        }
    }
}
