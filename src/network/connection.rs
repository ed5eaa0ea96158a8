use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::network::notify::Notifier;
use crate::network::transfer::{ReadOperation, WriteOperation};
use crate::network::{ConnectionRegistry, Packet, ReceivedEvent, SentEvent, LENGTH_PREFIX_SIZE};
use crate::service::{Shutdown, ShutdownTrigger};
use crate::{AppError, AppResult, ConnectionConfig};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a connection, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handles of a connection whose stream is live.
struct OpenStream {
    write_tx: async_channel::Sender<Packet>,
    close_trigger: ShutdownTrigger,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

enum ConnectionState {
    Idle,
    Opening,
    Open(OpenStream),
    Closed,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Opening => "opening",
            ConnectionState::Open(_) => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

struct ConnectionInner {
    id: ConnectionId,
    config: ConnectionConfig,
    /// Set only for connections accepted by a server.
    registry: Option<Weak<ConnectionRegistry>>,
    state: Mutex<ConnectionState>,
    // retaining: an accepted connection reads before its owner can subscribe
    received: Arc<Notifier<ReceivedEvent>>,
    sent: Arc<Notifier<SentEvent>>,
}

/// A packet connection over one byte stream.
///
/// Once open, a read pump task turns the incoming byte stream into
/// [`ReceivedEvent`]s and a writer task drains the write queue, publishing a
/// [`SentEvent`] per packet. Both are stopped by [`Connection::close`].
///
/// The handle is cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates an unconnected client connection. Call [`Connection::open`] or
    /// [`Connection::attach`] to bring it up.
    pub fn new() -> Connection {
        Self::with_config(ConnectionConfig::default())
    }

    pub fn with_config(config: ConnectionConfig) -> Connection {
        Self::build(config, None)
    }

    fn build(config: ConnectionConfig, registry: Option<Weak<ConnectionRegistry>>) -> Connection {
        let received = Arc::new(Notifier::retaining(config.event_capacity));
        let sent = Arc::new(Notifier::new(config.event_capacity));
        Connection {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                config,
                registry,
                state: Mutex::new(ConnectionState::Idle),
                received,
                sent,
            }),
        }
    }

    /// Wraps a stream accepted by a server. The connection is open on return
    /// and removes itself from `registry` when closed.
    pub(crate) fn accepted<S>(
        stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        registry: &Arc<ConnectionRegistry>,
        config: ConnectionConfig,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Self::build(config, Some(Arc::downgrade(registry)));
        let open = connection.start_io(stream, local_addr, peer_addr);
        *connection.inner.state.lock() = ConnectionState::Open(open);
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Whether both handles refer to the same connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_server_connection(&self) -> bool {
        self.inner.registry.is_some()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.inner.state.lock(), ConnectionState::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), ConnectionState::Closed)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.state.lock() {
            ConnectionState::Open(open) => open.peer_addr,
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.state.lock() {
            ConnectionState::Open(open) => open.local_addr,
            _ => None,
        }
    }

    /// Connects to `address` and starts the read pump.
    ///
    /// Fails without connecting if this connection was accepted by a server,
    /// or is already open, opening or closed. A failed connect leaves the
    /// connection idle so that it can be retried.
    pub async fn open<A: ToSocketAddrs>(&self, address: A) -> AppResult<()> {
        let mut opening = self.begin_opening()?;
        let stream = TcpStream::connect(address).await?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        opening.finish(stream, local_addr, peer_addr)
    }

    /// Brings the connection up over an already established stream.
    ///
    /// Same preconditions as [`Connection::open`]. Must be called from within
    /// a tokio runtime.
    pub fn attach<S>(&self, stream: S) -> AppResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut opening = self.begin_opening()?;
        opening.finish(stream, None, None)
    }

    fn begin_opening(&self) -> AppResult<OpeningGuard<'_>> {
        if self.is_server_connection() {
            return Err(AppError::IllegalStateError(format!(
                "connection {} was accepted by a server and cannot be opened",
                self.id()
            )));
        }
        let mut state = self.inner.state.lock();
        if !matches!(*state, ConnectionState::Idle) {
            return Err(AppError::IllegalStateError(format!(
                "connection {} cannot be opened while {}",
                self.id(),
                state.name()
            )));
        }
        *state = ConnectionState::Opening;
        Ok(OpeningGuard {
            connection: self,
            armed: true,
        })
    }

    /// Splits the stream and spawns the read pump and the writer.
    fn start_io<S>(
        &self,
        stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> OpenStream
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let close_trigger = ShutdownTrigger::new();
        let (write_tx, write_rx) = match self.inner.config.write_queue_capacity {
            Some(capacity) => async_channel::bounded(capacity.max(1)),
            None => async_channel::unbounded(),
        };

        let pump = ReadPump {
            connection_id: self.id(),
            reader,
            received: self.inner.received.clone(),
            shutdown: close_trigger.subscribe(),
            max_payload_size: self.inner.config.max_payload_size,
        };
        tokio::spawn(pump.run());

        let packet_writer = PacketWriter {
            connection_id: self.id(),
            writer,
            queue: write_rx,
            sent: self.inner.sent.clone(),
            shutdown: close_trigger.subscribe(),
        };
        tokio::spawn(packet_writer.run());

        debug!(connection = %self.id(), ?peer_addr, "connection io started");
        OpenStream {
            write_tx,
            close_trigger,
            local_addr,
            peer_addr,
        }
    }

    /// Queues a packet for sending and returns immediately.
    ///
    /// Packets are written in the order they were queued, one frame at a time.
    /// The outcome of each is published as a [`SentEvent`]. Fails if the
    /// connection is not open, or if `write_queue_capacity` is set and that
    /// many packets are already waiting.
    ///
    /// Without a `write_queue_capacity` the queue is unbounded: a peer that
    /// stops reading leaves every later packet buffered in memory until the
    /// connection is closed.
    pub fn write(&self, packet: Packet) -> AppResult<()> {
        let state = self.inner.state.lock();
        let ConnectionState::Open(open) = &*state else {
            return Err(AppError::IllegalStateError(format!(
                "cannot write to connection {} while {}",
                self.id(),
                state.name()
            )));
        };
        open.write_tx.try_send(packet).map_err(|err| match err {
            async_channel::TrySendError::Full(_) => AppError::WriteQueueFull(self.id()),
            async_channel::TrySendError::Closed(_) => AppError::ConnectionClosed(self.id()),
        })
    }

    /// Stops the read pump and the writer, releases the stream and leaves the
    /// owning registry, if any. Calling it again has no effect.
    ///
    /// Received events nobody subscribed to are discarded.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), ConnectionState::Closed);
        if let Some(registry) = self.inner.registry.as_ref().and_then(Weak::upgrade) {
            registry.remove(self);
        }
        self.inner.received.release_pending();
        if let ConnectionState::Open(open) = previous {
            open.write_tx.close();
            open.close_trigger.fire();
            info!(connection = %self.id(), peer_addr = ?open.peer_addr, "connection closed");
        }
    }

    /// Subscribes to received packets and read faults.
    ///
    /// The first subscriber sees every event since the connection was created;
    /// later subscribers see events published after they subscribed. The read
    /// pump waits for every subscriber to have room for the next event, so a
    /// subscriber that stops reading stalls the connection, and with it the
    /// peer. Drop the receiver to unsubscribe. The subscription ends after the
    /// pump halts.
    pub fn subscribe_received(&self) -> async_channel::Receiver<ReceivedEvent> {
        self.inner.received.subscribe()
    }

    /// Subscribes to write outcomes of packets written after this call.
    ///
    /// The writer waits for every subscriber to have room for the next event,
    /// the same way the read pump does.
    pub fn subscribe_sent(&self) -> async_channel::Receiver<SentEvent> {
        self.inner.sent.subscribe()
    }

    pub fn received_stream(&self) -> impl Stream<Item = ReceivedEvent> + Unpin + Send + 'static {
        Box::pin(self.subscribe_received())
    }

    pub fn sent_stream(&self) -> impl Stream<Item = SentEvent> + Unpin + Send + 'static {
        Box::pin(self.subscribe_sent())
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("server_owned", &self.is_server_connection())
            .field("state", &self.inner.state.lock().name())
            .finish()
    }
}

/// Returns a connection stuck in `Opening` to `Idle` if the connect fails or
/// the `open` future is dropped.
struct OpeningGuard<'a> {
    connection: &'a Connection,
    armed: bool,
}

impl OpeningGuard<'_> {
    fn finish<S>(
        &mut self,
        stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> AppResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.armed = false;
        let connection = self.connection;
        let mut state = connection.inner.state.lock();
        if !matches!(*state, ConnectionState::Opening) {
            // closed while connecting, the stream is dropped here
            return Err(AppError::ConnectionClosed(connection.id()));
        }
        *state = ConnectionState::Open(connection.start_io(stream, local_addr, peer_addr));
        info!(connection = %connection.id(), ?peer_addr, "connection opened");
        Ok(())
    }
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.connection.inner.state.lock();
        if matches!(*state, ConnectionState::Opening) {
            *state = ConnectionState::Idle;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PumpState {
    AwaitingLength,
    AwaitingPayload(u32),
}

/// Reads frames off the stream until it faults or the connection closes.
struct ReadPump<R> {
    connection_id: ConnectionId,
    reader: R,
    received: Arc<Notifier<ReceivedEvent>>,
    shutdown: Shutdown,
    max_payload_size: Option<u32>,
}

impl<R> ReadPump<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self) {
        let (partial, fault) = self.pump().await;
        if fault.is_transfer_fault() {
            debug!(connection = %self.connection_id, %fault, "read pump halted");
        } else {
            warn!(connection = %self.connection_id, %fault, "read pump halted");
        }
        self.received
            .publish(ReceivedEvent::faulted(self.connection_id, partial, fault))
            .await;
        self.received.close();
    }

    /// Runs until the first fault and returns it with the bytes of the
    /// interrupted frame.
    async fn pump(&mut self) -> (Packet, AppError) {
        let mut state = PumpState::AwaitingLength;
        loop {
            let size = match state {
                PumpState::AwaitingLength => LENGTH_PREFIX_SIZE,
                PumpState::AwaitingPayload(length) => length as usize,
            };
            let completed = tokio::select! {
                outcome = ReadOperation::new(&mut self.reader, size).execute() => {
                    Some((outcome.buffer, outcome.fault))
                }
                _ = self.shutdown.recv() => None,
            };
            let Some((buffer, fault)) = completed else {
                return (Packet::empty(), AppError::ConnectionClosed(self.connection_id));
            };
            if let Some(fault) = fault {
                return (Packet::from_wire(buffer), fault);
            }

            state = match state {
                PumpState::AwaitingLength => match self.check_length(&buffer) {
                    Ok(length) => PumpState::AwaitingPayload(length),
                    Err(fault) => return (Packet::from_wire(buffer), fault),
                },
                PumpState::AwaitingPayload(_) => {
                    let event = ReceivedEvent::delivered(self.connection_id, Packet::from_wire(buffer));
                    // a full subscriber holds the pump here, which in turn
                    // leaves the peer's data in the stream
                    tokio::select! {
                        _ = self.received.publish(event) => {}
                        _ = self.shutdown.recv() => {
                            return (Packet::empty(), AppError::ConnectionClosed(self.connection_id));
                        }
                    }
                    PumpState::AwaitingLength
                }
            };
        }
    }

    fn check_length(&self, prefix: &[u8]) -> AppResult<u32> {
        let length = Packet::decode_length(prefix)?;
        match self.max_payload_size {
            Some(max) if length > max => Err(AppError::MessageTooLarge(format!(
                "frame of length {} exceeds the limit of {}",
                length, max
            ))),
            _ => Ok(length),
        }
    }
}

/// Drains the write queue onto the stream, one frame at a time.
struct PacketWriter<W> {
    connection_id: ConnectionId,
    writer: W,
    queue: async_channel::Receiver<Packet>,
    sent: Arc<Notifier<SentEvent>>,
    shutdown: Shutdown,
}

impl<W> PacketWriter<W>
where
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        let connection_id = self.connection_id;
        loop {
            let packet = tokio::select! {
                packet = self.queue.recv() => match packet {
                    Ok(packet) => packet,
                    Err(_) => break,
                },
                _ = self.shutdown.recv() => break,
            };

            let fault = tokio::select! {
                outcome = WriteOperation::new(&mut self.writer, packet.framed()).execute() => {
                    outcome.fault
                }
                _ = self.shutdown.recv() => Some(AppError::ConnectionClosed(connection_id)),
            };
            if let Some(fault) = &fault {
                debug!(connection = %connection_id, %fault, "packet write failed");
            }
            self.sent
                .publish(SentEvent::new(connection_id, packet, fault))
                .await;

            if self.shutdown.is_shutdown() {
                break;
            }
        }

        self.queue.close();
        if let Err(err) = self.writer.shutdown().await {
            debug!(connection = %connection_id, %err, "stream shutdown failed");
        }
        // anything still queued will never reach the wire
        while let Ok(packet) = self.queue.try_recv() {
            let fault = Some(AppError::ConnectionClosed(connection_id));
            self.sent
                .publish(SentEvent::new(connection_id, packet, fault))
                .await;
        }
        self.sent.close();
        debug!(connection = %connection_id, "packet writer exited");
    }
}
