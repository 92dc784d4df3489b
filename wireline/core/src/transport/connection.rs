//! Connection Transport
//!
//! One [`Connection`] owns one TCP stream. It writes framed or raw payloads
//! and runs the read loop that turns incoming bytes into
//! [`TransportEvent::MessageReceived`] events.
//!
//! # Read loop
//!
//! The loop is a tokio task whose reads race the connection's shutdown
//! signal, so [`Connection::shutdown`] interrupts a read in flight.
//!
//! - Framed mode feeds a [`FrameDecoder`]. End of stream on a frame boundary
//!   is an orderly close; end of stream inside a frame is reported first.
//! - Raw mode reads into one reusable buffer and publishes exactly the slice
//!   that was read. A zero-length read is an orderly close.
//! - Transient read errors are published and the loop continues after a
//!   back-off, until `read_error_limit` consecutive failures (if set).
//! - Frames equal to a serialized disconnect sentinel end the loop without
//!   reaching subscribers.

use std::fmt;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::{CLIENT_DISCONNECTING, SERVER_DISCONNECTING};
use crate::serializer::{JsonSerializer, Serializer};

use super::events::{EventHub, Payload, TransportEvent};
use super::frame::{self, FrameDecoder};
use super::{TransportError, TransportOptions};

/// Read chunk size in framed mode
const FRAMED_READ_CHUNK: usize = 64 * 1024;

/// Global counter for connection IDs
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection
///
/// Ids are process-unique and increase with every accepted or opened stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Reserved control frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sentinel {
    /// Sent by a client before it closes its stream
    ClientDisconnecting,
    /// Sent by a server to every client before it stops
    ServerDisconnecting,
}

/// Sentinel strings as produced by the connection's serializer
#[derive(Debug)]
struct SentinelFrames {
    client: Vec<u8>,
    server: Vec<u8>,
}

impl SentinelFrames {
    fn encode<S: Serializer>(serializer: &S) -> Result<Self, TransportError> {
        Ok(Self {
            client: serializer.to_bytes(CLIENT_DISCONNECTING)?,
            server: serializer.to_bytes(SERVER_DISCONNECTING)?,
        })
    }

    fn get(&self, sentinel: Sentinel) -> &[u8] {
        match sentinel {
            Sentinel::ClientDisconnecting => &self.client,
            Sentinel::ServerDisconnecting => &self.server,
        }
    }

    /// Whether `payload` carries either sentinel
    ///
    /// Byte equality with our own encoding is checked first. Otherwise the
    /// payload is decoded as a string, so any valid encoding of a sentinel
    /// counts.
    fn matches<S: Serializer>(&self, serializer: &S, payload: &[u8]) -> bool {
        if payload == self.client.as_slice() || payload == self.server.as_slice() {
            return true;
        }

        matches!(
            serializer.from_bytes::<String>(payload),
            Ok(Some(value)) if value == CLIENT_DISCONNECTING || value == SERVER_DISCONNECTING
        )
    }
}

/// A live TCP stream with its read loop
pub struct Connection<M, S = JsonSerializer> {
    id: ConnectionId,
    peer: SocketAddr,
    serializer: Arc<S>,
    raw_mode: bool,
    options: TransportOptions,
    /// Write half; None once the stream is shut down
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    disposed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    sentinels: SentinelFrames,
    events: EventHub<TransportEvent<M>>,
    read_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<M, S> Connection<M, S>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    /// Wrap a stream
    ///
    /// The read loop is not running yet: hand the returned read half to
    /// [`start`](Self::start) once the connection is registered.
    pub(crate) fn new(
        stream: TcpStream,
        serializer: Arc<S>,
        raw_mode: bool,
        options: TransportOptions,
        events: EventHub<TransportEvent<M>>,
    ) -> Result<(Arc<Self>, OwnedReadHalf), TransportError> {
        let id = ConnectionId::next();
        let peer = stream.peer_addr()?;

        if options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(conn_id = %id, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let sentinels = SentinelFrames::encode(serializer.as_ref())?;
        let (reader, writer) = stream.into_split();
        let (shutdown_tx, _) = watch::channel(false);

        let connection = Arc::new(Self {
            id,
            peer,
            serializer,
            raw_mode,
            options,
            writer: tokio::sync::Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            shutdown_tx,
            sentinels,
            events,
            read_task: parking_lot::Mutex::new(None),
        });

        Ok((connection, reader))
    }

    /// Spawn the read loop
    ///
    /// `on_exit` runs exactly once, after the loop has ended on its own or
    /// through [`shutdown`](Self::shutdown). It does not run if the task is
    /// aborted.
    pub(crate) fn start<F>(self: &Arc<Self>, reader: OwnedReadHalf, on_exit: F)
    where
        F: FnOnce(ConnectionId) + Send + 'static,
    {
        let connection = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            connection.read_loop(reader, shutdown_rx).await;
            connection.connected.store(false, Ordering::SeqCst);
            connection.close_writer().await;
            tracing::info!(conn_id = %connection.id, "Connection ended");
            on_exit(connection.id);
        });

        *self.read_task.lock() = Some(handle);
    }

    /// Serialize, frame and write a message
    ///
    /// # Errors
    ///
    /// - `RawModeActive` if the connection is in raw mode
    /// - `NotConnected` if the stream has ended
    /// - `Serialization` if the message cannot be encoded
    /// - `SendFailed` if the write fails (an `Error` event is published too)
    pub async fn send(&self, message: &M) -> Result<(), TransportError> {
        if self.raw_mode {
            return Err(TransportError::RawModeActive);
        }
        self.ensure_connected()?;

        let payload = self.serializer.to_bytes(message)?;
        self.write_frame(&payload).await
    }

    /// Write bytes without framing
    ///
    /// # Errors
    ///
    /// - `NotConnected` if the stream has ended
    /// - `EmptyPayload` if `bytes` is empty
    /// - `SendFailed` if the write fails (an `Error` event is published too)
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if bytes.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        self.write_all(bytes).await
    }

    /// Send a disconnect sentinel as an ordinary frame
    pub(crate) async fn send_sentinel(&self, sentinel: Sentinel) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.write_frame(self.sentinels.get(sentinel)).await
    }

    /// Stop the read loop and shut the stream down
    ///
    /// Idempotent. Sends after this fail with `NotConnected`.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.connected.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        self.close_writer().await;

        tracing::debug!(conn_id = %self.id, "Connection disposed");
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn write_frame(&self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = frame::encode(payload)?;
        self.write_all(&frame).await
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        if let Err(e) = stream.write_all(bytes).await {
            tracing::warn!(conn_id = %self.id, error = %e, "Write error");
            self.connected.store(false, Ordering::SeqCst);
            let message = e.to_string();
            self.publish_error(TransportError::Io(e));
            return Err(TransportError::SendFailed(message));
        }

        tracing::trace!(conn_id = %self.id, bytes = bytes.len(), "Wrote bytes");
        Ok(())
    }

    async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut stream) = writer {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(conn_id = %self.id, error = %e, "Stream shutdown failed");
            }
        }
    }

    fn publish(&self, payload: Payload<M>) {
        self.events.publish(&TransportEvent::MessageReceived {
            connection: self.id,
            payload,
        });
    }

    fn publish_error(&self, error: TransportError) {
        self.events
            .publish(&TransportEvent::error(Some(self.id), error));
    }

    async fn read_loop<R>(&self, mut reader: R, mut shutdown: watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        if *shutdown.borrow_and_update() {
            return;
        }

        tracing::debug!(conn_id = %self.id, raw = self.raw_mode, "Read loop started");
        if self.raw_mode {
            self.read_raw(&mut reader, &mut shutdown).await;
        } else {
            self.read_framed(&mut reader, &mut shutdown).await;
        }
    }

    async fn read_raw<R>(&self, reader: &mut R, shutdown: &mut watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.options.raw_buffer_size];
        let mut consecutive_errors = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = reader.read(&mut buf) => result,
            };

            match result {
                Ok(0) => {
                    tracing::debug!(conn_id = %self.id, "Connection closed by peer");
                    break;
                }
                Ok(n) => {
                    consecutive_errors = 0;
                    tracing::trace!(conn_id = %self.id, bytes = n, "Raw read");
                    self.publish(Payload::Raw(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(e) => {
                    if self
                        .read_failed(e, &mut consecutive_errors, shutdown)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
            }
        }
    }

    async fn read_framed<R>(&self, reader: &mut R, shutdown: &mut watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::with_max_frame_len(self.options.max_frame_len);
        let mut buf = vec![0u8; FRAMED_READ_CHUNK];
        let mut consecutive_errors = 0u32;

        'read: loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = reader.read(&mut buf) => result,
            };

            match result {
                Ok(0) => {
                    if decoder.has_partial_frame() {
                        tracing::warn!(
                            conn_id = %self.id,
                            buffered = decoder.available(),
                            "Stream ended inside a frame"
                        );
                        self.publish_error(TransportError::Io(
                            std::io::ErrorKind::UnexpectedEof.into(),
                        ));
                    } else {
                        tracing::debug!(conn_id = %self.id, "Connection closed by peer");
                    }
                    break;
                }
                Ok(n) => {
                    consecutive_errors = 0;
                    decoder.push(&buf[..n]);

                    loop {
                        match decoder.next_frame() {
                            Ok(Some(payload)) => {
                                if self.process_frame(&payload).is_break() {
                                    break 'read;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                // The stream cannot be resynchronized after a bad header
                                tracing::warn!(conn_id = %self.id, error = %e, "Frame rejected");
                                self.publish_error(e);
                                break 'read;
                            }
                        }
                    }
                }
                Err(e) => {
                    if self
                        .read_failed(e, &mut consecutive_errors, shutdown)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Handle one complete framed payload
    fn process_frame(&self, payload: &[u8]) -> ControlFlow<()> {
        if self.sentinels.matches(self.serializer.as_ref(), payload) {
            tracing::info!(conn_id = %self.id, "Peer is disconnecting");
            return ControlFlow::Break(());
        }

        match self.serializer.from_bytes::<M>(payload) {
            Ok(Some(message)) => {
                tracing::trace!(conn_id = %self.id, bytes = payload.len(), "Frame received");
                self.publish(Payload::Message(Arc::new(message)));
            }
            Ok(None) => {
                tracing::debug!(conn_id = %self.id, "Dropping frame without a value");
            }
            Err(e) => {
                tracing::warn!(
                    conn_id = %self.id,
                    codec = self.serializer.name(),
                    error = %e,
                    "Failed to decode frame"
                );
                self.publish_error(e.into());
            }
        }

        ControlFlow::Continue(())
    }

    /// Report a read error and decide whether to keep reading
    async fn read_failed(
        &self,
        error: std::io::Error,
        consecutive: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ControlFlow<()> {
        let error = TransportError::Io(error);
        tracing::warn!(conn_id = %self.id, error = %error, "Read error");

        let disconnected = error.is_disconnect();
        self.publish_error(error);
        if disconnected {
            return ControlFlow::Break(());
        }

        *consecutive += 1;
        if let Some(limit) = self.options.read_error_limit {
            if *consecutive >= limit {
                tracing::warn!(conn_id = %self.id, limit, "Read error limit reached");
                return ControlFlow::Break(());
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => ControlFlow::Break(()),
            () = tokio::time::sleep(self.options.error_backoff()) => ControlFlow::Continue(()),
        }
    }
}

impl<M, S> Connection<M, S> {
    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether this connection carries unframed bytes
    #[must_use]
    pub fn is_raw_mode(&self) -> bool {
        self.raw_mode
    }

    /// Whether the stream is still usable
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_disposed()
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Abort the read loop without running its exit hook
    pub(crate) fn abort(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
    }
}

impl<M, S: Serializer> fmt::Debug for Connection<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("serializer", &self.serializer.name())
            .field("raw_mode", &self.raw_mode)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
