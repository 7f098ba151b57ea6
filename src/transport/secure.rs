//! # Secure Transport
//!
//! Server and client lifecycles for RingMaster connections.
//!
//! ```text
//! Created ──start_server/start_client──▶ Running ──stop──▶ Stopped ──start──▶ Running
//!    │                                      │
//!    └───────────────close──────────────────┴──▶ Closed
//! ```
//!
//! Every accepted or established socket is secured according to the
//! [`SecurityPolicy`], then both ends exchange their protocol version
//! (`u32` little-endian) and settle on the negotiated one before the
//! connection is registered and announced through `on_new_connection`.
//!
//! The client side races a connection attempt to every endpoint, keeps the
//! first that succeeds, and reconnects after `reconnect_delay` whenever the
//! connection is lost, until stopped.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures::future::{select_ok, BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::codec::PacketCodec;
use crate::core::version::ProtocolVersion;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::connection::{Connection, ConnectionLimits};
use crate::transport::tls::{BoxedStream, SecurityPolicy};
use crate::utils::timeout::{with_timeout, with_timeout_error};

/// Consecutive accept failures after which the accept loop gives up.
pub const MAX_ACCEPT_FAILURES: u32 = 25;

const LISTEN_BACKLOG: u32 = 1024;

/// Callback receiving a connection as it is established or lost.
pub type ConnectionHandler = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// Picks the version used on a connection from `(local, remote)`.
pub type VersionNegotiator = Arc<dyn Fn(u32, u32) -> u32 + Send + Sync>;

/// Settings of a [`SecureTransport`].
#[derive(Clone)]
pub struct TransportOptions {
    pub protocol_version: u32,
    pub max_connections: usize,
    pub max_connection_lifespan: Duration,
    pub max_connection_idle_time: Duration,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub send_queue_length: usize,
    pub max_unflushed_packets: usize,
    pub max_packet_size: usize,
    pub use_network_byte_order: bool,
    pub authentication_timeout: Duration,
    pub start_timeout: Duration,
    pub connect_timeout: Duration,
    pub stop_timeout: Duration,
    pub reconnect_delay: Duration,
    pub security: SecurityPolicy,
    pub negotiator: VersionNegotiator,
}

impl Default for TransportOptions {
    fn default() -> Self {
        let config = NetworkConfig::default();
        Self::with_security(&config, SecurityPolicy::Plain)
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("protocol_version", &self.protocol_version)
            .field("max_connections", &self.max_connections)
            .field("send_queue_length", &self.send_queue_length)
            .field("authentication_timeout", &self.authentication_timeout)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl TransportOptions {
    /// Options from every section of `config`, loading TLS material when enabled.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let security = SecurityPolicy::from_config(&config.tls)?;
        Ok(Self::with_security(config, security))
    }

    fn with_security(config: &NetworkConfig, security: SecurityPolicy) -> Self {
        Self {
            protocol_version: config.protocol.version,
            max_connections: config.server.max_connections,
            max_connection_lifespan: config.transport.max_connection_lifespan,
            max_connection_idle_time: config.transport.max_connection_idle_time,
            send_buffer_size: config.transport.send_buffer_size,
            receive_buffer_size: config.transport.receive_buffer_size,
            send_queue_length: config.transport.send_queue_length,
            max_unflushed_packets: config.transport.max_unflushed_packets,
            max_packet_size: config.protocol.max_packet_size,
            use_network_byte_order: config.protocol.use_network_byte_order,
            authentication_timeout: config.transport.authentication_timeout,
            start_timeout: config.server.start_timeout,
            connect_timeout: config.client.connect_timeout,
            stop_timeout: config.server.stop_timeout,
            reconnect_delay: config.client.reconnect_delay,
            security,
            negotiator: Arc::new(|local: u32, remote: u32| local.min(remote)),
        }
    }

    pub fn with_security_policy(mut self, security: SecurityPolicy) -> Self {
        self.security = security;
        self
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_negotiator(mut self, negotiator: VersionNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            codec: PacketCodec::new(self.max_packet_size)
                .with_network_byte_order(self.use_network_byte_order),
            max_unflushed_packets: self.max_unflushed_packets,
            max_lifespan: self.max_connection_lifespan,
            max_idle_time: self.max_connection_idle_time,
        }
    }
}

/// Split a connection string of `host:port` entries separated by `,` or `;`.
pub fn parse_connection_string(connection_string: &str) -> Result<Vec<SocketAddr>> {
    let mut endpoints = Vec::new();
    for entry in connection_string
        .split([',', ';'])
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        match entry.parse::<SocketAddr>() {
            Ok(addr) => endpoints.push(addr),
            Err(_) => {
                let resolved = entry.to_socket_addrs().map_err(|e| {
                    ProtocolError::ConfigError(format!("Invalid endpoint '{entry}': {e}"))
                })?;
                endpoints.extend(resolved);
            }
        }
    }

    if endpoints.is_empty() {
        return Err(ProtocolError::ConfigError(
            constants::ERR_NO_ENDPOINTS.to_string(),
        ));
    }
    Ok(endpoints)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Server,
    Client,
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    running: Option<Running>,
    closed: bool,
}

struct Shared {
    options: TransportOptions,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    drained: Notify,
    on_new_connection: RwLock<Option<ConnectionHandler>>,
    on_connection_lost: RwLock<Option<ConnectionHandler>>,
    next_id: AtomicU64,
}

/// Multi-connection RingMaster transport, usable as a server or a client.
pub struct SecureTransport {
    shared: Arc<Shared>,
    root: CancellationToken,
    state: tokio::sync::Mutex<State>,
}

impl fmt::Debug for SecureTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureTransport")
            .field("options", &self.shared.options)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl SecureTransport {
    /// Build a transport. Cancelling `cancellation` aborts in-flight
    /// authentication and tears down every connection.
    pub fn new(options: TransportOptions, cancellation: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                connections: Mutex::new(HashMap::new()),
                drained: Notify::new(),
                on_new_connection: RwLock::new(None),
                on_connection_lost: RwLock::new(None),
                next_id: AtomicU64::new(1),
            }),
            root: cancellation.child_token(),
            state: tokio::sync::Mutex::new(State::default()),
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.shared.options
    }

    pub fn set_on_new_connection<F>(&self, handler: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        set_handler(&self.shared.on_new_connection, Arc::new(handler));
    }

    pub fn set_on_connection_lost<F>(&self, handler: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        set_handler(&self.shared.on_connection_lost, Arc::new(handler));
    }

    /// Listen on `addr` and accept connections in the background.
    ///
    /// Returns the bound address, so port 0 picks an ephemeral port.
    #[instrument(skip(self))]
    pub async fn start_server(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        Self::ensure_startable(&state)?;

        let options = &self.shared.options;
        let listener = with_timeout(
            async { self.bind(addr) },
            options.start_timeout,
            || ProtocolError::StartTimedOut,
        )
        .await?;
        let local = listener.local_addr()?;

        let token = self.root.child_token();
        let task = tokio::spawn(Arc::clone(&self.shared).accept_loop(listener, token.clone()));
        state.running = Some(Running { token, task });

        info!(address = %local, max_connections = options.max_connections, "Server started");
        Ok(local)
    }

    /// Connect to the first reachable endpoint and keep reconnecting until stopped.
    #[instrument(skip(self))]
    pub async fn start_client(&self, endpoints: Vec<SocketAddr>) -> Result<()> {
        if endpoints.is_empty() {
            return Err(ProtocolError::ConnectionFailed(
                constants::ERR_NO_ENDPOINTS.to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        Self::ensure_startable(&state)?;

        let token = self.root.child_token();
        let task = tokio::spawn(Arc::clone(&self.shared).connect_loop(endpoints, token.clone()));
        state.running = Some(Running { token, task });

        info!("Client started");
        Ok(())
    }

    /// [`start_client`](Self::start_client) over a `host:port,host:port` string.
    pub async fn start_client_with(&self, connection_string: &str) -> Result<()> {
        let endpoints = parse_connection_string(connection_string)?;
        self.start_client(endpoints).await
    }

    /// Stop accepting or reconnecting and disconnect every connection.
    ///
    /// The transport can be started again afterwards.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(Running { token, mut task }) = state.running.take() else {
            return Err(ProtocolError::NotStarted);
        };

        token.cancel();
        for connection in self.connections() {
            connection.disconnect();
        }

        let shared = &self.shared;
        let drain = async {
            if let Err(e) = (&mut task).await {
                if !e.is_cancelled() {
                    error!(error = %e, "Transport task failed");
                }
            }
            loop {
                let notified = shared.drained.notified();
                if shared.connection_count() == 0 {
                    break;
                }
                notified.await;
            }
            Ok(())
        };

        let outcome = with_timeout(drain, shared.options.stop_timeout, || {
            ProtocolError::StopTimedOut
        })
        .await;
        if outcome.is_err() {
            task.abort();
            warn!("Transport did not stop in time");
        } else {
            info!("Transport stopped");
        }
        outcome
    }

    /// Stop if running and refuse any later start. Safe to call repeatedly.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }

        match self.stop().await {
            Ok(()) | Err(ProtocolError::NotStarted) => {}
            Err(e) => warn!(error = %e, "Stop during close failed"),
        }
        self.root.cancel();
        debug!("Transport closed");
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .running
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Snapshot of the registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .registry()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    fn ensure_startable(state: &State) -> Result<()> {
        if state.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        if state.running.is_some() {
            return Err(ProtocolError::AlreadyStarted);
        }
        Ok(())
    }

    fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        let options = &self.shared.options;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_send_buffer_size(u32::try_from(options.send_buffer_size).unwrap_or(u32::MAX))?;
        socket.set_recv_buffer_size(
            u32::try_from(options.receive_buffer_size).unwrap_or(u32::MAX),
        )?;
        socket.bind(addr)?;
        Ok(socket.listen(LISTEN_BACKLOG)?)
    }
}

impl Drop for SecureTransport {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn set_handler(slot: &RwLock<Option<ConnectionHandler>>, handler: ConnectionHandler) {
    match slot.write() {
        Ok(mut guard) => *guard = Some(handler),
        Err(poisoned) => *poisoned.into_inner() = Some(handler),
    }
}

fn get_handler(slot: &RwLock<Option<ConnectionHandler>>) -> Option<ConnectionHandler> {
    match slot.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

impl Shared {
    fn registry(&self) -> Result<MutexGuard<'_, HashMap<u64, Arc<Connection>>>> {
        self.connections
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))
    }

    fn connection_count(&self) -> usize {
        self.registry().map(|c| c.len()).unwrap_or(0)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.options.max_connections.max(1)));
        let mut failures = 0u32;

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    failures = 0;
                    debug!(%remote, "Accepted socket");
                    let shared = Arc::clone(&self);
                    let token = token.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = shared.handle_connection(stream, remote, Side::Server, &token).await {
                            warn!(%remote, error = %e, "Inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "Accept failed");
                    if failures >= MAX_ACCEPT_FAILURES {
                        error!(failures, "Too many consecutive accept failures; accept loop stopping");
                        break;
                    }
                }
            }
        }

        info!("Accept loop stopped");
    }

    async fn connect_loop(self: Arc<Self>, endpoints: Vec<SocketAddr>, token: CancellationToken) {
        while !token.is_cancelled() {
            match self.connect_any(&endpoints, &token).await {
                Ok((stream, remote)) => {
                    if let Err(e) = self.handle_connection(stream, remote, Side::Client, &token).await {
                        warn!(%remote, error = %e, "Outbound connection failed");
                    }
                }
                Err(e) => warn!(error = %e, "No endpoint reachable"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }
        }

        info!("Connect loop stopped");
    }

    async fn connect_any(
        &self,
        endpoints: &[SocketAddr],
        token: &CancellationToken,
    ) -> Result<(TcpStream, SocketAddr)> {
        let connect_timeout = self.options.connect_timeout;
        let attempts: Vec<BoxFuture<'static, Result<(TcpStream, SocketAddr)>>> = endpoints
            .iter()
            .map(|&addr| {
                async move {
                    let connect = async {
                        TcpStream::connect(addr).await.map_err(|e| {
                            ProtocolError::ConnectionFailed(format!("{addr}: {e}"))
                        })
                    };
                    let stream = with_timeout_error(connect, connect_timeout).await?;
                    Ok::<_, ProtocolError>((stream, addr))
                }
                .boxed()
            })
            .collect();

        let race = async { select_ok(attempts).await.map(|(first, _rest)| first) };
        tokio::select! {
            _ = token.cancelled() => Err(ProtocolError::ConnectionFailed("cancelled".into())),
            outcome = with_timeout(race, self.options.start_timeout, || {
                ProtocolError::ConnectionFailed("connect timed out".into())
            }) => outcome,
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        side: Side,
        token: &CancellationToken,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%remote, error = %e, "Failed to set TCP_NODELAY");
        }

        let options = &self.options;
        let (mut stream, identity) = match side {
            Side::Server => {
                options
                    .security
                    .secure_server(stream, options.authentication_timeout, token)
                    .await?
            }
            Side::Client => {
                options
                    .security
                    .secure_client(stream, remote, options.authentication_timeout, token)
                    .await?
            }
        };

        let version = self.negotiate(&mut stream, token).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (connection, outgoing) =
            Connection::new(id, remote, identity, version, options.send_queue_length, token);
        self.registry()?.insert(id, Arc::clone(&connection));
        info!(
            connection_id = id,
            %remote,
            ?side,
            protocol_version = version,
            remote_identity = ?connection.remote_identity(),
            "Connection established"
        );

        if let Some(handler) = get_handler(&self.on_new_connection) {
            handler(Arc::clone(&connection));
        }

        Arc::clone(&connection)
            .run(stream, outgoing, options.limits())
            .await;

        if let Ok(mut registry) = self.registry() {
            registry.remove(&id);
        }
        self.drained.notify_waiters();
        info!(connection_id = id, %remote, "Connection lost");

        if let Some(handler) = get_handler(&self.on_connection_lost) {
            handler(connection);
        }
        Ok(())
    }

    async fn negotiate(&self, stream: &mut BoxedStream, token: &CancellationToken) -> Result<u32> {
        let local = self.options.protocol_version;
        let exchange = async {
            stream.write_u32_le(local).await?;
            stream.flush().await?;
            Ok::<u32, ProtocolError>(stream.read_u32_le().await?)
        };

        let remote = tokio::select! {
            _ = token.cancelled() => return Err(ProtocolError::AuthenticationCancelled),
            remote = with_timeout(exchange, self.options.authentication_timeout, || {
                ProtocolError::AuthenticationTimedOut
            }) => remote?,
        };

        let agreed = (self.options.negotiator)(local, remote);
        ProtocolVersion::new(agreed)?;
        debug!(local, remote, agreed, "Protocol version negotiated");
        Ok(agreed)
    }
}
