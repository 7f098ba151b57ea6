//! # Connection
//!
//! One established (and optionally authenticated) peer link.
//!
//! A connection owns three tasks once it runs:
//! - a writer draining the bounded send queue into the framed stream,
//!   flushing after `max_unflushed_packets` or whenever the queue is empty
//! - a reader handing every received packet to the installed handler
//! - a watchdog disconnecting the link when it outlives its lifespan or sits
//!   idle for too long
//!
//! [`Connection::disconnect`] may be called any number of times from any task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::codec::PacketCodec;
use crate::error::{ProtocolError, Result};
use crate::transport::tls::BoxedStream;

/// Callback for packets received on a connection.
pub type PacketHandler = Arc<dyn Fn(&Arc<Connection>, Bytes) + Send + Sync>;

/// Limits applied to a running connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub codec: PacketCodec,
    pub max_unflushed_packets: usize,
    pub max_lifespan: Duration,
    pub max_idle_time: Duration,
}

pub struct Connection {
    id: u64,
    remote_address: SocketAddr,
    remote_identity: Option<String>,
    protocol_version: u32,
    created: Instant,
    /// Millis since `created` at the last received packet.
    last_activity: AtomicU64,
    sender: mpsc::Sender<Bytes>,
    on_packet_received: RwLock<Option<PacketHandler>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("remote_identity", &self.remote_identity)
            .field("protocol_version", &self.protocol_version)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Build a connection whose send queue holds `send_queue_length` packets.
    /// Cancelling `parent` disconnects it.
    pub(crate) fn new(
        id: u64,
        remote_address: SocketAddr,
        remote_identity: Option<String>,
        protocol_version: u32,
        send_queue_length: usize,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(send_queue_length.max(1));
        let connection = Arc::new(Self {
            id,
            remote_address,
            remote_identity,
            protocol_version,
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
            sender,
            on_packet_received: RwLock::new(None),
            closed: AtomicBool::new(false),
            shutdown: parent.child_token(),
        });
        (connection, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Thumbprint of the peer's leaf certificate; `None` on plain connections.
    pub fn remote_identity(&self) -> Option<&str> {
        self.remote_identity.as_deref()
    }

    /// Version both ends agreed on.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Install the callback invoked for every received packet.
    pub fn set_packet_handler(&self, handler: PacketHandler) {
        match self.on_packet_received.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    /// Queue `packet` for sending without waiting.
    pub fn send(&self, packet: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.sender.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => ProtocolError::SendQueueFull,
            TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    /// Tear the connection down. Later calls do nothing.
    pub fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(connection_id = self.id, remote = %self.remote_address, "Disconnecting");
            self.shutdown.cancel();
        }
    }

    /// Resolves once the connection has been disconnected.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    fn touch(&self) {
        let now = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity.store(now, Ordering::Relaxed);
    }

    fn handler(&self) -> Option<PacketHandler> {
        match self.on_packet_received.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Pump `stream` until the peer goes away or the connection is disconnected.
    pub(crate) async fn run(
        self: Arc<Self>,
        stream: BoxedStream,
        outgoing: mpsc::Receiver<Bytes>,
        limits: ConnectionLimits,
    ) {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = FramedWrite::new(write_half, limits.codec);
        let reader = FramedRead::new(read_half, limits.codec);

        let write_task = tokio::spawn(Self::write_loop(
            Arc::clone(&self),
            writer,
            outgoing,
            limits.max_unflushed_packets.max(1),
        ));
        let watchdog = tokio::spawn(Self::watchdog(
            Arc::clone(&self),
            limits.max_lifespan,
            limits.max_idle_time,
        ));

        self.read_loop(reader).await;
        self.disconnect();

        if let Err(e) = write_task.await {
            warn!(connection_id = self.id, error = %e, "Writer task failed");
        }
        let _ = watchdog.await;
        debug!(connection_id = self.id, "Connection finished");
    }

    async fn read_loop(self: &Arc<Self>, mut reader: FramedRead<ReadHalf<BoxedStream>, PacketCodec>) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(packet)) => {
                    self.touch();
                    trace!(connection_id = self.id, bytes = packet.len(), "Packet received");
                    match self.handler() {
                        Some(handler) => handler(self, packet),
                        None => debug!(connection_id = self.id, "Packet dropped: no handler"),
                    }
                }
                Some(Err(e)) => {
                    warn!(connection_id = self.id, error = %e, "Read failed");
                    break;
                }
                None => {
                    debug!(connection_id = self.id, "Remote closed the connection");
                    break;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: FramedWrite<WriteHalf<BoxedStream>, PacketCodec>,
        mut outgoing: mpsc::Receiver<Bytes>,
        max_unflushed: usize,
    ) {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = outgoing.recv() => match next {
                    Some(packet) => packet,
                    None => break,
                },
            };

            if let Err(e) = self.write_batch(&mut writer, &mut outgoing, packet, max_unflushed).await {
                warn!(connection_id = self.id, error = %e, "Write failed");
                self.disconnect();
                break;
            }
        }

        let _ = writer.close().await;
    }

    async fn write_batch(
        &self,
        writer: &mut FramedWrite<WriteHalf<BoxedStream>, PacketCodec>,
        outgoing: &mut mpsc::Receiver<Bytes>,
        first: Bytes,
        max_unflushed: usize,
    ) -> Result<()> {
        writer.feed(first).await?;
        let mut unflushed = 1;
        while unflushed < max_unflushed {
            match outgoing.try_recv() {
                Ok(packet) => {
                    writer.feed(packet).await?;
                    unflushed += 1;
                }
                Err(_) => break,
            }
        }
        writer.flush().await?;
        trace!(connection_id = self.id, packets = unflushed, "Flushed");
        Ok(())
    }

    async fn watchdog(self: Arc<Self>, max_lifespan: Duration, max_idle_time: Duration) {
        let period = max_lifespan
            .min(max_idle_time)
            .div_f64(4.0)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.age() >= max_lifespan {
                        info!(connection_id = self.id, age_ms = self.age().as_millis() as u64, "Connection lifespan exceeded");
                        self.disconnect();
                        break;
                    }
                    if self.idle_time() >= max_idle_time {
                        info!(connection_id = self.id, idle_ms = self.idle_time().as_millis() as u64, "Connection idle time exceeded");
                        self.disconnect();
                        break;
                    }
                }
            }
        }
    }
}
