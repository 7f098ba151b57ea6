//! # Server Sessions
//!
//! Binds a [`RequestHandler`] to a server-mode [`SecureTransport`]. Every
//! connection gets a [`Session`] that decodes its packets at the connection's
//! negotiated version, hands the calls to the handler in arrival order and
//! sends back the encoded responses.
//!
//! Init is answered by the session itself. Until a session has seen Init,
//! other requests are refused with `SessionExpired`. When a redirect is
//! installed, every request after Init is answered with `SessionMoved` and the
//! suggested endpoint instead of reaching the handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::core::primitives::Guid;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::client::WATCHER_CALL_ID;
use crate::protocol::communication::RingMasterCommunicationProtocol;
use crate::protocol::dispatcher::RequestHandler;
use crate::protocol::request::{RequestCall, RequestKind};
use crate::protocol::response::{Content, RequestResponse, RingMasterResultCode};
use crate::protocol::types::{RedirectSuggested, WatcherCall};
use crate::transport::{Connection, SecureTransport};

/// Produces the endpoint clients are sent to instead of being served.
pub type RedirectFn = Arc<dyn Fn() -> RedirectSuggested + Send + Sync>;

/// Serves RingMaster requests arriving on one or more transports.
pub struct RingMasterServer {
    handler: Arc<dyn RequestHandler>,
    redirect: Option<RedirectFn>,
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,
    /// Live sessions keyed by connection id.
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl fmt::Debug for RingMasterServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingMasterServer")
            .field("total_sessions", &self.total_session_count())
            .field("active_sessions", &self.active_session_count())
            .field("redirect", &self.redirect.is_some())
            .finish()
    }
}

impl RingMasterServer {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            handler,
            redirect: None,
            total_sessions: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_redirect<F>(mut self, redirect: F) -> Self
    where
        F: Fn() -> RedirectSuggested + Send + Sync + 'static,
    {
        self.redirect = Some(Arc::new(redirect));
        self
    }

    /// Sessions ever created.
    pub fn total_session_count(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    pub fn active_session_count(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.table()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Open a session for every connection `transport` establishes.
    pub fn register_transport(self: &Arc<Self>, transport: &SecureTransport) {
        let server = Arc::clone(self);
        transport.set_on_new_connection(move |connection| server.on_new_connection(connection));
        let server = Arc::clone(self);
        transport.set_on_connection_lost(move |connection| server.on_connection_lost(&connection));
        debug!("Transport registered");
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<u64, Arc<Session>>>> {
        self.sessions
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_SESSIONS_LOCK.to_string()))
    }

    fn on_new_connection(&self, connection: Arc<Connection>) {
        let id = self.total_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let (session, calls) = Session::new(
            id,
            Arc::clone(&connection),
            Arc::clone(&self.handler),
            self.redirect.clone(),
        );
        check_version(&connection);

        let receiver = Arc::downgrade(&session);
        connection.set_packet_handler(Arc::new(move |_: &Arc<Connection>, packet: Bytes| {
            if let Some(session) = receiver.upgrade() {
                session.on_packet_received(&packet);
            }
        }));
        tokio::spawn(Arc::clone(&session).run(calls));

        match self.table() {
            Ok(mut sessions) => {
                sessions.insert(connection.id(), session);
            }
            Err(e) => warn!(session_id = id, error = %e, "Session not tracked"),
        }
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = id,
            connection_id = connection.id(),
            client = %connection.remote_address(),
            "Session created"
        );
    }

    fn on_connection_lost(&self, connection: &Connection) {
        let session = self
            .table()
            .ok()
            .and_then(|mut sessions| sessions.remove(&connection.id()));
        if let Some(session) = session {
            self.active_sessions.fetch_sub(1, Ordering::Relaxed);
            info!(
                session_id = session.id(),
                connection_id = connection.id(),
                client = %connection.remote_address(),
                "Session closed"
            );
        }
    }
}

fn check_version(connection: &Connection) {
    let version = connection.protocol_version();
    let supported = RingMasterCommunicationProtocol::MINIMUM_SUPPORTED_VERSION
        ..=RingMasterCommunicationProtocol::MAXIMUM_SUPPORTED_VERSION;
    if !supported.contains(&version) {
        warn!(connection_id = connection.id(), version, "Unsupported protocol version");
        connection.disconnect();
    }
}

/// Server side of one client connection.
pub struct Session {
    id: u64,
    connection: Arc<Connection>,
    protocol: RingMasterCommunicationProtocol,
    handler: Arc<dyn RequestHandler>,
    redirect: Option<RedirectFn>,
    initialized: AtomicBool,
    calls: mpsc::UnboundedSender<RequestCall>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Session {
    fn new(
        id: u64,
        connection: Arc<Connection>,
        handler: Arc<dyn RequestHandler>,
        redirect: Option<RedirectFn>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RequestCall>) {
        let (calls, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            connection,
            protocol: RingMasterCommunicationProtocol::new(),
            handler,
            redirect,
            initialized: AtomicBool::new(false),
            calls,
        });
        (session, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Push a watcher notification to the client.
    pub fn notify_watcher(&self, call: WatcherCall) -> Result<()> {
        trace!(session_id = self.id, watcher_id = call.watcher_id, "Sending watcher notification");
        let message = RequestResponse::new(WATCHER_CALL_ID, RingMasterResultCode::Ok)
            .with_content(Content::WatcherCall(call));
        self.send_response(message)
    }

    /// Decode `packet` and queue it behind earlier calls.
    fn on_packet_received(&self, packet: &[u8]) {
        let version = self.connection.protocol_version();
        match self.protocol.deserialize_request(packet, version) {
            Ok(call) => {
                if self.calls.send(call).is_err() {
                    debug!(session_id = self.id, "Session no longer accepting calls");
                }
            }
            Err(e) => {
                warn!(session_id = self.id, version, error = %e, "Invalid request packet");
                self.connection.disconnect();
            }
        }
    }

    /// Hand queued calls to the handler one at a time. Responses may still
    /// complete out of order.
    #[instrument(skip_all, fields(session_id = self.id))]
    async fn run(self: Arc<Self>, mut calls: mpsc::UnboundedReceiver<RequestCall>) {
        loop {
            tokio::select! {
                _ = self.connection.closed() => break,
                call = calls.recv() => match call {
                    Some(call) => Arc::clone(&self).process(call),
                    None => break,
                },
            }
        }
        debug!("Session finished");
    }

    fn process(self: Arc<Self>, call: RequestCall) {
        let call_id = call.call_id;
        let request_type = call.request.request_type();
        debug!(call_id, ?request_type, path = %call.request.path, "Processing request");

        if let RequestKind::Init { session_id, .. } = &call.request.kind {
            self.initialized.store(true, Ordering::Release);
            let content = Content::StringArray(vec![
                session_id.to_string(),
                Guid::new_random().to_string(),
            ]);
            self.respond(RequestResponse::ok(call_id, content));
            return;
        }

        if !self.is_initialized() {
            warn!(call_id, "Session has not been initialized");
            self.respond(RequestResponse::new(call_id, RingMasterResultCode::SessionExpired));
            return;
        }

        if let Some(redirect) = &self.redirect {
            let suggested = redirect();
            debug!(call_id, suggested = ?suggested.suggested_connection_string, "Redirecting");
            let response = RequestResponse::new(call_id, RingMasterResultCode::SessionMoved)
                .with_path(call.request.path.clone())
                .with_content(Content::Redirect(suggested));
            self.respond(response);
            return;
        }

        let started = Instant::now();
        let pending = self.handler.send(call);
        tokio::spawn(async move {
            let response = match pending.await {
                Ok(mut response) => {
                    response.call_id = call_id;
                    response
                }
                Err(e) => {
                    warn!(call_id, error = %e, "Request failed");
                    RequestResponse::new(call_id, RingMasterResultCode::SystemError)
                }
            };
            self.respond(response);
            debug!(call_id, ?request_type, elapsed = ?started.elapsed(), "Request completed");
        });
    }

    fn respond(&self, response: RequestResponse) {
        let call_id = response.call_id;
        if let Err(e) = self.send_response(response) {
            warn!(session_id = self.id, call_id, error = %e, "Failed to send response");
        }
    }

    fn send_response(&self, response: RequestResponse) -> Result<()> {
        let packet = self
            .protocol
            .serialize_response(response, self.connection.protocol_version())?;
        self.connection.send(packet)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::protocol::dispatcher::RequestDispatcher;
    use crate::protocol::request::{Request, RingMasterRequestType};

    const VERSION: u32 = 19;

    struct Harness {
        session: Arc<Session>,
        sent: mpsc::Receiver<Bytes>,
        dispatched: Arc<Mutex<Vec<String>>>,
        _token: CancellationToken,
    }

    fn harness(redirect: Option<RedirectFn>) -> Harness {
        let token = CancellationToken::new();
        let (connection, sent) = Connection::new(
            1,
            "127.0.0.1:9000".parse().unwrap(),
            None,
            VERSION,
            16,
            &token,
        );
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&dispatched);
        let dispatcher = RequestDispatcher::new();
        dispatcher
            .register(RingMasterRequestType::Sync, move |call| {
                seen.lock().unwrap().push(call.request.path.clone());
                Ok(RequestResponse::ok(0, Content::String(call.request.path.clone())))
            })
            .unwrap();
        let (session, calls) = Session::new(7, connection, Arc::new(dispatcher), redirect);
        tokio::spawn(Arc::clone(&session).run(calls));
        Harness {
            session,
            sent,
            dispatched,
            _token: token,
        }
    }

    impl Harness {
        fn submit(&self, call_id: u64, request: Request) {
            let packet = RingMasterCommunicationProtocol::new()
                .serialize_request(&RequestCall::new(call_id, request), VERSION)
                .unwrap();
            self.session.on_packet_received(&packet);
        }

        async fn reply(&mut self) -> RequestResponse {
            let packet = tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
                .await
                .unwrap()
                .unwrap();
            RingMasterCommunicationProtocol::new()
                .deserialize_response(&packet, VERSION)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_init_answers_with_session_id_and_token() {
        let mut h = harness(None);
        h.submit(1, Request::init(42, ""));

        let response = h.reply().await;
        assert_eq!(response.call_id, 1);
        assert!(response.is_ok());
        let values = match response.content {
            Content::StringArray(values) => values,
            other => panic!("unexpected content: {other:?}"),
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], "42");
        assert!(h.session.is_initialized());
    }

    #[tokio::test]
    async fn test_requests_before_init_are_refused() {
        let mut h = harness(None);
        h.submit(5, Request::sync("/early"));
        let response = h.reply().await;
        assert_eq!(response.call_id, 5);
        assert_eq!(response.code(), Some(RingMasterResultCode::SessionExpired));
    }

    #[tokio::test]
    async fn test_calls_reach_handler_in_order() {
        let mut h = harness(None);
        h.submit(1, Request::init(0, ""));
        h.reply().await;

        for id in 2..6u64 {
            h.submit(id, Request::sync(format!("/n{id}")));
        }
        let mut answered = Vec::new();
        for _ in 2..6u64 {
            let response = h.reply().await;
            assert_eq!(
                response.content,
                Content::String(format!("/n{}", response.call_id))
            );
            answered.push(response.call_id);
        }
        answered.sort_unstable();
        assert_eq!(answered, vec![2, 3, 4, 5]);
        assert_eq!(*h.dispatched.lock().unwrap(), vec!["/n2", "/n3", "/n4", "/n5"]);
    }

    #[tokio::test]
    async fn test_redirect_replaces_dispatch() {
        let redirect: RedirectFn = Arc::new(|| RedirectSuggested {
            suggested_connection_string: Some("10.0.0.2:99".into()),
        });
        let mut h = harness(Some(redirect));
        h.submit(1, Request::init(0, ""));
        assert!(h.reply().await.is_ok());

        h.submit(2, Request::sync("/moved"));
        let response = h.reply().await;
        assert_eq!(response.code(), Some(RingMasterResultCode::SessionMoved));
        assert_eq!(response.response_path.as_deref(), Some("/moved"));
        assert!(matches!(response.content, Content::Redirect(r) if r.suggested_connection_string.as_deref() == Some("10.0.0.2:99")));
    }

    #[tokio::test]
    async fn test_malformed_packet_disconnects() {
        let h = harness(None);
        h.session.on_packet_received(&[0xde, 0xad]);
        assert!(!h.session.connection().is_connected());
    }
}
