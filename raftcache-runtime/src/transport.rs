//! TCP transport for Raft messages and node-to-node RPCs.
//!
//! # Design
//!
//! Outbound traffic goes through a pool keyed by peer address. Each pooled
//! entry owns one TCP connection and one writer task fed by a bounded queue.
//! Frames are encoded before they are queued, so a frame that cannot be sent
//! is reported to the caller:
//! - Raft messages are queued with `try_send`; a full queue drops the message
//!   and Raft's own retries recover
//! - RPC requests carry a reply channel; responses come back on the same
//!   connection and are matched by `request_id`
//!
//! Inbound connections are accepted on the node's listener. Raft frames are
//! forwarded to the raft actor, RPC requests are handed to an [`RpcHandler`]
//! and answered on the connection they arrived on.
//!
//! # Connection Lifecycle
//!
//! 1. A pool entry is created on first use of an address
//! 2. The TCP connection is opened lazily by the writer task
//! 3. After a failure the writer reconnects with exponential backoff
//! 4. `retain` drops entries for addresses that left the configuration,
//!    which closes their connections

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use raftcache_raft::Message;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{decode_frame, encode_frame, CodecError, Frame};
use crate::transport_trait::RaftTransport;

/// Initial read buffer size (64 KiB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum queued frames per peer.
const QUEUE_CAPACITY_DEFAULT: usize = 1024;

/// Default connection timeout.
const CONNECT_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

/// Reconnect backoff bounds.
const RECONNECT_DELAY_MIN: Duration = Duration::from_millis(50);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(5);

/// Maximum queued responses per inbound connection.
const RESPONSE_QUEUE_CAPACITY: usize = 256;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind to address.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to connect to peer.
    #[error("failed to connect to {address}: {source}")]
    ConnectFailed {
        /// The peer address.
        address: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is shutdown.
    #[error("transport is shutdown")]
    Shutdown,

    /// Send queue full.
    #[error("send queue full for {address}")]
    QueueFull {
        /// The peer address.
        address: String,
    },

    /// No response arrived before the deadline.
    #[error("request to {address} timed out")]
    Timeout {
        /// The peer address.
        address: String,
    },

    /// The connection closed before a response arrived.
    #[error("connection to {address} lost")]
    ConnectionLost {
        /// The peer address.
        address: String,
    },
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A Raft message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Address the sender advertised for replies.
    pub from_address: String,
    /// The message.
    pub message: Message,
}

/// Serves RPC requests arriving on the listener.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handles one request body and returns the response body.
    async fn handle(&self, body: Bytes) -> Bytes;
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Address stamped on outgoing Raft frames. Defaults to the bound address.
    pub advertise_address: Option<String>,
    /// Maximum queued frames per peer.
    pub queue_capacity: usize,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Creates a new transport configuration.
    #[must_use]
    pub const fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            advertise_address: None,
            queue_capacity: QUEUE_CAPACITY_DEFAULT,
            connect_timeout: CONNECT_TIMEOUT_DEFAULT,
        }
    }

    /// Sets the advertised address.
    #[must_use]
    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }
}

/// Queued outbound work for one peer: encoded frames.
enum Outbound {
    Raft(Bytes),
    Request {
        request_id: u64,
        frame: Bytes,
        reply: oneshot::Sender<Bytes>,
    },
}

/// Calls awaiting a response on one physical connection.
type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Bytes>>>>;

/// A pooled peer: the queue feeding its writer task.
struct PeerConnection {
    sender: mpsc::Sender<Outbound>,
}

struct Shared {
    advertise_address: String,
    queue_capacity: usize,
    connect_timeout: Duration,
    pool: Mutex<HashMap<String, PeerConnection>>,
    next_request_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Handle to interact with the transport.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("advertise_address", &self.shared.advertise_address)
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    /// Queues a Raft message for `address`.
    ///
    /// # Errors
    /// Returns `Codec` if the message does not fit in a frame, `QueueFull`
    /// if the peer's queue is full, or `Shutdown`.
    pub async fn send_message(&self, address: &str, message: Message) -> TransportResult<()> {
        let frame = encode_raft_frame(address, &self.shared.advertise_address, message)?;
        let sender = self.connection(address).await?;
        sender
            .try_send(Outbound::Raft(frame))
            .map_err(|e| queue_error(address, &e))
    }

    /// Sends an RPC request to `address` and waits for its response.
    ///
    /// # Errors
    /// Returns `Timeout` if no response arrives within `timeout`,
    /// `ConnectionLost` if the connection fails first, `Codec` if the body
    /// does not fit in a frame, or a queueing error.
    pub async fn call(&self, address: &str, body: Bytes, timeout: Duration) -> TransportResult<Bytes> {
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();

        let frame = encode_frame(&Frame::Request { request_id, body }).map_err(|e| {
            warn!(
                address = %address,
                request_id,
                size = frame_size(&e),
                error = %e,
                "Rejecting RPC request that does not fit in a frame"
            );
            TransportError::Codec(e)
        })?;
        let sender = self.connection(address).await?;
        sender
            .try_send(Outbound::Request {
                request_id,
                frame,
                reply,
            })
            .map_err(|e| queue_error(address, &e))?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(TransportError::ConnectionLost {
                address: address.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout {
                address: address.to_string(),
            }),
        }
    }

    /// Closes pooled connections to addresses not in `addresses`.
    pub async fn retain(&self, addresses: &HashSet<String>) {
        let mut pool = self.shared.pool.lock().await;
        pool.retain(|address, _| {
            let keep = addresses.contains(address);
            if !keep {
                info!(address = %address, "Closing connection to departed peer");
            }
            keep
        });
    }

    /// Returns the addresses currently in the connection pool, sorted.
    pub async fn pooled_addresses(&self) -> Vec<String> {
        let pool = self.shared.pool.lock().await;
        let mut addresses: Vec<String> = pool.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Returns the address stamped on outgoing Raft frames.
    #[must_use]
    pub fn advertise_address(&self) -> &str {
        &self.shared.advertise_address
    }

    /// Stops accepting connections and closes every pooled connection.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.pool.lock().await.clear();
    }

    /// Returns true if the transport is shutdown.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Returns the queue for `address`, creating the pool entry if needed.
    async fn connection(&self, address: &str) -> TransportResult<mpsc::Sender<Outbound>> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown);
        }

        let mut pool = self.shared.pool.lock().await;
        if let Some(conn) = pool.get(address) {
            if !conn.sender.is_closed() {
                return Ok(conn.sender.clone());
            }
        }

        let (sender, receiver) = mpsc::channel(self.shared.queue_capacity);
        tokio::spawn(writer_loop(
            address.to_string(),
            receiver,
            self.shared.connect_timeout,
        ));
        pool.insert(
            address.to_string(),
            PeerConnection {
                sender: sender.clone(),
            },
        );
        drop(pool);

        debug!(address = %address, "Added peer to connection pool");
        Ok(sender)
    }
}

#[async_trait]
impl RaftTransport for TransportHandle {
    async fn send(&self, address: &str, message: Message) {
        if let Err(e) = self.send_message(address, message).await {
            debug!(address = %address, error = %e, "Dropped outbound Raft message");
        }
    }

    async fn retain(&self, addresses: &HashSet<String>) {
        Self::retain(self, addresses).await;
    }
}

/// Encodes a Raft message for `address`, logging what was dropped if it
/// does not fit in a frame.
fn encode_raft_frame(address: &str, from_address: &str, message: Message) -> TransportResult<Bytes> {
    let frame = Frame::Raft {
        from_address: from_address.to_string(),
        message,
    };
    encode_frame(&frame).map_err(|e| {
        if let Frame::Raft { message, .. } = &frame {
            warn!(
                address = %address,
                kind = message.kind(),
                to = %message.to(),
                term = message.term().get(),
                size = frame_size(&e),
                error = %e,
                "Dropping Raft message that does not fit in a frame"
            );
        }
        TransportError::Codec(e)
    })
}

/// Returns the rejected frame size carried by `err`, or 0.
const fn frame_size(err: &CodecError) -> u64 {
    match err {
        CodecError::FrameTooLarge { size, .. } => *size,
        _ => 0,
    }
}

fn queue_error<T>(address: &str, err: &TrySendError<T>) -> TransportError {
    match err {
        TrySendError::Full(_) => TransportError::QueueFull {
            address: address.to_string(),
        },
        TrySendError::Closed(_) => TransportError::ConnectionLost {
            address: address.to_string(),
        },
    }
}

/// TCP transport for node-to-node communication.
pub struct Transport {
    listener: TcpListener,
    handle: TransportHandle,
    incoming_tx: mpsc::Sender<IncomingMessage>,
}

impl Transport {
    /// Binds the listener.
    ///
    /// Returns the transport and a receiver for incoming Raft messages.
    /// Outbound sends work immediately; call `serve` to start accepting.
    ///
    /// # Errors
    /// Returns an error if binding fails.
    pub fn bind(config: TransportConfig) -> TransportResult<(Self, mpsc::Receiver<IncomingMessage>)> {
        // Bind the listener with SO_REUSEADDR to allow quick restarts.
        let listener = create_reusable_listener(config.listen_addr).map_err(|e| {
            TransportError::BindFailed {
                addr: config.listen_addr,
                source: e,
            }
        })?;
        let local_addr = listener.local_addr()?;
        let advertise_address = config
            .advertise_address
            .unwrap_or_else(|| local_addr.to_string());

        info!(
            addr = %local_addr,
            advertise = %advertise_address,
            "Transport listening"
        );

        let (incoming_tx, incoming_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown, _) = watch::channel(false);
        let handle = TransportHandle {
            shared: Arc::new(Shared {
                advertise_address,
                queue_capacity: config.queue_capacity,
                connect_timeout: config.connect_timeout,
                pool: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                shutdown,
            }),
        };

        Ok((
            Self {
                listener,
                handle,
                incoming_tx,
            },
            incoming_rx,
        ))
    }

    /// Returns the bound address.
    ///
    /// # Errors
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns a handle for sending.
    #[must_use]
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Starts accepting connections, serving RPCs with `handler`.
    pub fn serve(self, handler: Arc<dyn RpcHandler>) -> JoinHandle<()> {
        let shutdown = self.handle.shared.shutdown.subscribe();
        tokio::spawn(accept_loop(self.listener, self.incoming_tx, handler, shutdown))
    }
}

/// Loop that accepts incoming connections.
async fn accept_loop(
    listener: TcpListener,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    handler: Arc<dyn RpcHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        incoming_tx.clone(),
                        Arc::clone(&handler),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Reads frames from one inbound connection until it closes.
async fn serve_connection(
    stream: TcpStream,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    handler: Arc<dyn RpcHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Responses may complete out of order; one task owns the write half.
    let (response_tx, mut response_rx) = mpsc::channel::<Bytes>(RESPONSE_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(bytes) = response_rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(error = %e, "Failed to write response");
                break;
            }
        }
    });

    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader, &mut buffer) => frame,
        };

        match frame {
            Ok(Some(Frame::Raft {
                from_address,
                message,
            })) => {
                let incoming = IncomingMessage {
                    from_address,
                    message,
                };
                if incoming_tx.send(incoming).await.is_err() {
                    // Receiver dropped.
                    break;
                }
            }
            Ok(Some(Frame::Request { request_id, body })) => {
                let handler = Arc::clone(&handler);
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let body = handler.handle(body).await;
                    match encode_frame(&Frame::Response { request_id, body }) {
                        Ok(bytes) => {
                            let _ = response_tx.send(bytes).await;
                        }
                        Err(e) => warn!(request_id, error = %e, "Failed to encode response"),
                    }
                });
            }
            Ok(Some(Frame::Response { request_id, .. })) => {
                debug!(request_id, "Ignoring response on inbound connection");
            }
            Ok(None) => {
                debug!("Connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Closing connection after read failure");
                break;
            }
        }
    }
}

/// Owns the outbound connection to one peer address.
async fn writer_loop(
    address: String,
    mut queue: mpsc::Receiver<Outbound>,
    connect_timeout: Duration,
) {
    let mut connection: Option<(tokio::net::tcp::OwnedWriteHalf, PendingCalls)> = None;
    let mut reconnect_delay = RECONNECT_DELAY_MIN;

    while let Some(item) = queue.recv().await {
        if connection.is_none() {
            match connect_to_peer(&address, connect_timeout).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    let pending = PendingCalls::default();
                    tokio::spawn(response_loop(reader, Arc::clone(&pending), address.clone()));
                    connection = Some((writer, pending));
                    reconnect_delay = RECONNECT_DELAY_MIN;
                    info!(address = %address, "Connected to peer");
                }
                Err(e) => {
                    warn!(
                        address = %address,
                        error = %e,
                        retry_ms = reconnect_delay.as_millis(),
                        "Failed to connect, dropping frame"
                    );
                    // Dropping the item fails any waiting call immediately.
                    drop(item);
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(RECONNECT_DELAY_MAX);
                    continue;
                }
            }
        }
        let Some((writer, pending)) = connection.as_mut() else {
            continue;
        };

        let bytes = match item {
            Outbound::Raft(frame) => frame,
            Outbound::Request {
                request_id,
                frame,
                reply,
            } => {
                let mut calls = pending.lock().await;
                // Forget calls whose callers already gave up.
                calls.retain(|_, waiting| !waiting.is_closed());
                calls.insert(request_id, reply);
                frame
            }
        };

        if let Err(e) = writer.write_all(&bytes).await {
            warn!(
                address = %address,
                size = bytes.len(),
                error = %e,
                "Failed to send frame, reconnecting"
            );
            connection = None;
        }
    }

    debug!(address = %address, "Connection queue closed");
}

/// Completes pending calls as responses arrive on an outbound connection.
async fn response_loop(mut reader: OwnedReadHalf, pending: PendingCalls, address: String) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        match read_frame(&mut reader, &mut buffer).await {
            Ok(Some(Frame::Response { request_id, body })) => {
                if let Some(reply) = pending.lock().await.remove(&request_id) {
                    let _ = reply.send(body);
                }
            }
            Ok(Some(_)) => {
                debug!(address = %address, "Ignoring non-response frame on outbound connection");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(address = %address, error = %e, "Outbound connection read failed");
                break;
            }
        }
    }

    // Fail whatever is still waiting on this connection.
    pending.lock().await.clear();
}

/// Reads the next complete frame, or `None` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> TransportResult<Option<Frame>> {
    loop {
        match decode_frame(buffer) {
            Ok((frame, consumed)) => {
                buffer.advance(consumed);
                return Ok(Some(frame));
            }
            Err(CodecError::InsufficientData { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        if reader.read_buf(buffer).await? == 0 {
            return Ok(None);
        }
    }
}

/// Connects to a peer with timeout.
///
/// The address is resolved at connection time to support hostnames.
async fn connect_to_peer(address: &str, timeout: Duration) -> TransportResult<TcpStream> {
    let connect_future = async {
        let mut addrs = tokio::net::lookup_host(address).await?;
        let resolved = addrs.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {address}"),
            )
        })?;
        TcpStream::connect(resolved).await
    };

    match tokio::time::timeout(timeout, connect_future).await {
        Ok(Ok(stream)) => {
            // Disable Nagle's algorithm for lower latency.
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(TransportError::ConnectFailed {
            address: address.to_string(),
            source: e,
        }),
        Err(_) => Err(TransportError::ConnectFailed {
            address: address.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

/// Create a TCP listener with `SO_REUSEADDR` enabled.
///
/// This allows a restarted node to bind to a port that is in `TIME_WAIT`.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    // Backlog of 128 pending connections.
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
