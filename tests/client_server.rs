//! Loopback tests of the client request handler against server sessions
//!
//! Every test runs a real server transport with a [`RingMasterServer`] in
//! front of a handler, and a [`RingMasterRequestHandler`] connected to it.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use serial_test::serial;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ringmaster_protocol::error::Result;
use ringmaster_protocol::protocol::dispatcher::{RequestDispatcher, RequestHandler};
use ringmaster_protocol::protocol::request::{Request, RequestCall, RingMasterRequestType};
use ringmaster_protocol::protocol::response::{Content, RequestResponse, RingMasterResultCode};
use ringmaster_protocol::protocol::types::{
    GetDataOptions, KeeperState, RedirectSuggested, Stat, WatchedEvent, WatchedEventType,
    WatcherCall, WatcherKind,
};
use ringmaster_protocol::protocol::watcher::EventWatcher;
use ringmaster_protocol::protocol::{
    RequestOptions, RingMasterCommunicationProtocol, RingMasterRequestHandler, RingMasterServer,
};
use ringmaster_protocol::transport::{Connection, SecureTransport, TransportOptions};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn options() -> TransportOptions {
    let mut options = TransportOptions::default();
    options.reconnect_delay = Duration::from_millis(50);
    options.stop_timeout = Duration::from_secs(5);
    options.authentication_timeout = Duration::from_secs(5);
    options
}

fn request_options(request_timeout: Duration, max_retries: u32) -> RequestOptions {
    RequestOptions {
        request_timeout,
        heartbeat_interval: Duration::from_secs(30),
        max_retries,
        retry_delay: Duration::from_millis(10),
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(EVENT_TIMEOUT, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

struct Server {
    server: Arc<RingMasterServer>,
    transport: SecureTransport,
    addr: SocketAddr,
}

async fn serve(server: RingMasterServer, transport_options: TransportOptions) -> Server {
    let server = Arc::new(server);
    let transport = SecureTransport::new(transport_options, CancellationToken::new());
    server.register_transport(&transport);
    let addr = transport.start_server(loopback()).await.unwrap();
    Server {
        server,
        transport,
        addr,
    }
}

async fn connect(addr: SocketAddr, request_options: RequestOptions) -> RingMasterRequestHandler {
    let transport = SecureTransport::new(options(), CancellationToken::new());
    let client = RingMasterRequestHandler::new(transport, request_options);
    client.start(vec![addr]).await.unwrap();
    eventually("client session", || client.is_connected()).await;
    client
}

fn data_dispatcher() -> RequestDispatcher {
    let dispatcher = RequestDispatcher::new();
    dispatcher
        .register(RingMasterRequestType::GetData, |call| {
            let stat = Stat {
                version: 3,
                ..Stat::default()
            };
            Ok(RequestResponse::ok(0, Content::ByteArray(call.request.path.clone().into_bytes()))
                .with_stat(stat))
        })
        .unwrap();
    dispatcher
        .register(RingMasterRequestType::Exists, |_| {
            Ok(RequestResponse::ok(0, Content::Stat(Stat::default())))
        })
        .unwrap();
    dispatcher
}

/// Never answers.
struct Stalling;

impl RequestHandler for Stalling {
    fn send(&self, _: RequestCall) -> BoxFuture<'static, Result<RequestResponse>> {
        Box::pin(future::pending())
    }
}

/// Answers with `code` for the first `failures` calls, then with Ok.
struct Flaky {
    code: RingMasterResultCode,
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl RequestHandler for Flaky {
    fn send(&self, call: RequestCall) -> BoxFuture<'static, Result<RequestResponse>> {
        let seen = self.calls.fetch_add(1, Ordering::SeqCst);
        let response = if seen < self.failures {
            RequestResponse::new(call.call_id, self.code)
        } else {
            RequestResponse::ok(call.call_id, Content::Empty)
        };
        Box::pin(future::ready(Ok(response)))
    }
}

async fn finish<F: Future<Output = ()>>(client: RingMasterRequestHandler, close_server: F) {
    client.close().await;
    close_server.await;
}

// ============================================================================
// Request / response
// ============================================================================

#[tokio::test]
#[serial]
async fn test_request_round_trip_over_loopback() {
    let s = serve(RingMasterServer::new(Arc::new(data_dispatcher())), options()).await;
    let client = connect(s.addr, RequestOptions::default()).await;

    let response = client
        .request(Request::get_data("/svc/a", GetDataOptions::empty(), None))
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(response.content, Content::ByteArray(b"/svc/a".to_vec()));
    assert_eq!(response.stat.unwrap().version, 3);
    assert_eq!(client.pending_count(), 0);

    assert_eq!(s.server.total_session_count(), 1);
    assert_eq!(s.server.active_session_count(), 1);
    assert!(s.server.sessions()[0].is_initialized());

    client.close().await;
    let server = Arc::clone(&s.server);
    eventually("session close", || server.active_session_count() == 0).await;
    s.transport.close().await;
}

#[tokio::test]
#[serial]
async fn test_session_decodes_at_negotiated_version() {
    let s = serve(
        RingMasterServer::new(Arc::new(data_dispatcher())),
        options().with_protocol_version(25),
    )
    .await;

    let transport = SecureTransport::new(options().with_protocol_version(16), CancellationToken::new());
    let client = RingMasterRequestHandler::new(transport, RequestOptions::default());
    client.start(vec![s.addr]).await.unwrap();
    eventually("client session", || client.is_connected()).await;

    let response = client
        .request(Request::get_data("/v16", GetDataOptions::empty(), None))
        .await
        .unwrap();
    assert_eq!(response.content, Content::ByteArray(b"/v16".to_vec()));
    assert_eq!(s.server.sessions()[0].connection().protocol_version(), 16);

    finish(client, s.transport.close()).await;
}

#[tokio::test]
#[serial]
async fn test_client_serves_as_request_handler() {
    let s = serve(RingMasterServer::new(Arc::new(data_dispatcher())), options()).await;
    let client = Arc::new(connect(s.addr, RequestOptions::default()).await);

    let handler: Arc<dyn RequestHandler> = Arc::clone(&client) as Arc<dyn RequestHandler>;
    let response = handler
        .send(RequestCall::new(77, Request::exists("/x", None)))
        .await
        .unwrap();
    assert_eq!(response.call_id, 77);
    assert_eq!(response.content, Content::Stat(Stat::default()));

    client.close().await;
    s.transport.close().await;
}

// ============================================================================
// Timeouts, retries and connection loss
// ============================================================================

#[tokio::test]
#[serial]
async fn test_unanswered_request_times_out() {
    let s = serve(RingMasterServer::new(Arc::new(Stalling)), options()).await;
    let client = connect(s.addr, request_options(Duration::from_millis(200), 0)).await;

    let response = client.request(Request::sync("/stall")).await.unwrap();
    assert_eq!(response.code(), Some(RingMasterResultCode::OperationTimeout));
    assert_eq!(client.pending_count(), 0);

    finish(client, s.transport.close()).await;
}

#[tokio::test]
#[serial]
async fn test_retriable_codes_are_retried_up_to_limit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = Flaky {
        code: RingMasterResultCode::ConnectionLoss,
        failures: 1,
        calls: Arc::clone(&calls),
    };
    let s = serve(RingMasterServer::new(Arc::new(flaky)), options()).await;
    let client = connect(s.addr, request_options(Duration::from_secs(2), 2)).await;

    let response = client.request(Request::sync("/flaky")).await.unwrap();
    assert!(response.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    finish(client, s.transport.close()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let failing = Flaky {
        code: RingMasterResultCode::OperationTimeout,
        failures: usize::MAX,
        calls: Arc::clone(&calls),
    };
    let s = serve(RingMasterServer::new(Arc::new(failing)), options()).await;
    let client = connect(s.addr, request_options(Duration::from_secs(2), 1)).await;

    let response = client.request(Request::sync("/down")).await.unwrap();
    assert_eq!(response.code(), Some(RingMasterResultCode::OperationTimeout));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    finish(client, s.transport.close()).await;
}

#[tokio::test]
#[serial]
async fn test_non_retriable_code_is_returned_at_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = Flaky {
        code: RingMasterResultCode::NoNode,
        failures: 1,
        calls: Arc::clone(&calls),
    };
    let s = serve(RingMasterServer::new(Arc::new(flaky)), options()).await;
    let client = connect(s.addr, request_options(Duration::from_secs(2), 3)).await;

    let response = client.request(Request::sync("/missing")).await.unwrap();
    assert_eq!(response.code(), Some(RingMasterResultCode::NoNode));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    finish(client, s.transport.close()).await;
}

#[tokio::test]
#[serial]
async fn test_connection_loss_fails_pending_requests() {
    let s = serve(RingMasterServer::new(Arc::new(Stalling)), options()).await;
    let client = Arc::new(connect(s.addr, request_options(Duration::from_secs(30), 0)).await);

    let waiting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request(Request::sync("/stall")).await }
    });
    eventually("request in flight", || client.pending_count() == 1).await;

    s.transport.stop().await.unwrap();
    let response = timeout(EVENT_TIMEOUT, waiting)
        .await
        .expect("pending request not failed on connection loss")
        .unwrap()
        .unwrap();
    assert_eq!(response.code(), Some(RingMasterResultCode::ConnectionLoss));
    assert_eq!(client.pending_count(), 0);

    client.close().await;
    s.transport.close().await;
}

// ============================================================================
// Watchers and redirects
// ============================================================================

#[tokio::test]
#[serial]
async fn test_watcher_notification_reaches_client() {
    let s = serve(RingMasterServer::new(Arc::new(data_dispatcher())), options()).await;
    let client = connect(s.addr, RequestOptions::default()).await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let callback: Arc<dyn EventWatcher> = Arc::new(move |event: &WatchedEvent| {
        let _ = events_tx.send(event.clone());
    });
    let watcher = client
        .watchers()
        .register(WatcherKind::ONE_USE, callback)
        .unwrap();
    let response = client
        .request(Request::exists("/w", Some(watcher)))
        .await
        .unwrap();
    assert!(response.is_ok());

    let session = s.server.sessions().pop().unwrap();
    session
        .notify_watcher(WatcherCall {
            watcher_id: watcher.id,
            kind: watcher.kind,
            event: Some(WatchedEvent::new(
                WatchedEventType::NodeDataChanged,
                KeeperState::SyncConnected,
                "/w",
            )),
        })
        .unwrap();

    let event = timeout(EVENT_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, WatchedEventType::NodeDataChanged);
    assert_eq!(event.path, "/w");
    assert!(client.watchers().is_empty());

    finish(client, s.transport.close()).await;
}

#[tokio::test]
#[serial]
async fn test_redirecting_server_answers_session_moved() {
    let server = RingMasterServer::new(Arc::new(data_dispatcher())).with_redirect(|| {
        RedirectSuggested {
            suggested_connection_string: Some("10.1.1.1:99".to_string()),
        }
    });
    let s = serve(server, options()).await;
    let client = connect(s.addr, RequestOptions::default()).await;

    let response = client
        .request(Request::get_data("/elsewhere", GetDataOptions::empty(), None))
        .await
        .unwrap();
    assert_eq!(response.code(), Some(RingMasterResultCode::SessionMoved));
    match response.content {
        Content::Redirect(redirect) => {
            assert_eq!(redirect.suggested_connection_string.as_deref(), Some("10.1.1.1:99"))
        }
        other => panic!("unexpected content: {other:?}"),
    }

    finish(client, s.transport.close()).await;
}

#[tokio::test]
#[serial]
async fn test_server_refuses_requests_before_init() {
    let s = serve(RingMasterServer::new(Arc::new(data_dispatcher())), options()).await;

    let raw = SecureTransport::new(options(), CancellationToken::new());
    let (connected_tx, mut connected) = mpsc::unbounded_channel();
    let (packets_tx, mut packets) = mpsc::unbounded_channel();
    raw.set_on_new_connection(move |connection| {
        let packets_tx = packets_tx.clone();
        connection.set_packet_handler(Arc::new(move |_: &Arc<Connection>, packet: Bytes| {
            let _ = packets_tx.send(packet);
        }));
        let _ = connected_tx.send(connection);
    });
    raw.start_client(vec![s.addr]).await.unwrap();
    let connection: Arc<Connection> = timeout(EVENT_TIMEOUT, connected.recv())
        .await
        .unwrap()
        .unwrap();

    let protocol = RingMasterCommunicationProtocol::new();
    let version = connection.protocol_version();
    let call = RequestCall::new(11, Request::get_data("/early", GetDataOptions::empty(), None));
    connection
        .send(protocol.serialize_request(&call, version).unwrap())
        .unwrap();

    let packet = timeout(EVENT_TIMEOUT, packets.recv()).await.unwrap().unwrap();
    let response = protocol.deserialize_response(&packet, version).unwrap();
    assert_eq!(response.call_id, 11);
    assert_eq!(response.code(), Some(RingMasterResultCode::SessionExpired));

    raw.close().await;
    s.transport.close().await;
}
