//! TCP Server
//!
//! Server role of the transport: listens on `0.0.0.0:port`, wraps every
//! accepted stream in a [`Connection`], and keeps the live set in a
//! [`ConnectionRegistry`].
//!
//! # Lifecycle events
//!
//! - `ClientAdded` once per accepted stream, after it is registered
//! - `ClientRemoved` once per connection, when its read loop ends
//! - `Error` for accept failures (no connection id) and per-connection
//!   read, send and decode failures
//!
//! # Example
//!
//! ```ignore
//! let server = Server::<Command>::start_new(Arc::new(JsonSerializer), 9000).await?;
//! let mut events = server.subscribe();
//!
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::MessageReceived { connection, payload } = event {
//!         server.notify_client(connection, &Command::Ack).await?;
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::serializer::{JsonSerializer, Serializer};

use super::connection::{Connection, ConnectionId, Sentinel};
use super::events::{EventHub, Subscription, TransportEvent};
use super::registry::{BroadcastResult, ConnectionRegistry};
use super::{TransportError, TransportOptions};

/// State that exists only while listening
struct Listening {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Multi-connection TCP listener
pub struct Server<M, S = JsonSerializer> {
    serializer: Arc<S>,
    port: u16,
    raw_mode: bool,
    options: TransportOptions,
    registry: ConnectionRegistry<M, S>,
    events: EventHub<TransportEvent<M>>,
    listening: parking_lot::Mutex<Option<Listening>>,
    disposed: AtomicBool,
}

impl<M, S> Server<M, S>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    /// Create a server that is not yet listening
    ///
    /// Port 0 asks the OS for an ephemeral port; see [`local_addr`](Self::local_addr).
    pub fn new(serializer: Arc<S>, port: u16) -> Self {
        Self {
            serializer,
            port,
            raw_mode: false,
            options: TransportOptions::default(),
            registry: ConnectionRegistry::new(),
            events: EventHub::new(),
            listening: parking_lot::Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a server and start listening
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the port cannot be bound.
    pub async fn start_new(serializer: Arc<S>, port: u16) -> Result<Self, TransportError> {
        let server = Self::new(serializer, port);
        server.start().await?;
        Ok(server)
    }

    /// Accept connections in raw mode
    #[must_use]
    pub fn with_raw_mode(mut self, raw_mode: bool) -> Self {
        self.raw_mode = raw_mode;
        self
    }

    /// Replace the transport options
    ///
    /// Fields that [`TransportOptions::validate`] rejects fall back to
    /// their defaults.
    #[must_use]
    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options.sanitized();
        self
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// Does nothing if the server is already listening.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the server was disposed
    /// - `Io` if the port cannot be bound
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.is_disposed() {
            return Err(TransportError::InvalidState("Server is disposed".to_string()));
        }
        if self.listening.lock().is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.port))).await?;
        let local_addr = listener.local_addr()?;

        let mut listening = self.listening.lock();
        if listening.is_some() {
            // Lost a race with a concurrent start; our listener is dropped
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = Acceptor {
            listener,
            serializer: Arc::clone(&self.serializer),
            raw_mode: self.raw_mode,
            options: self.options.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
        };
        let accept_task = tokio::spawn(acceptor.run(shutdown_rx));

        *listening = Some(Listening {
            local_addr,
            shutdown_tx,
            accept_task,
        });

        tracing::info!(addr = %local_addr, raw = self.raw_mode, "Server listening");
        Ok(())
    }

    /// Subscribe to server events
    #[must_use]
    pub fn subscribe(&self) -> Subscription<TransportEvent<M>> {
        self.events.subscribe()
    }

    /// Send a message to every connected client
    pub async fn notify_clients(&self, message: &M) -> BroadcastResult {
        self.registry.broadcast(message).await
    }

    /// Send raw bytes to every connected client
    pub async fn raw_notify_clients(&self, bytes: &[u8]) -> BroadcastResult {
        self.registry.broadcast_raw(bytes).await
    }

    /// Send a message to one client
    ///
    /// # Errors
    ///
    /// Returns `SendFailed` for an unknown connection, otherwise whatever
    /// [`Connection::send`] returns.
    pub async fn notify_client(&self, id: ConnectionId, message: &M) -> Result<(), TransportError> {
        self.lookup(id)?.send(message).await
    }

    /// Send raw bytes to one client
    ///
    /// # Errors
    ///
    /// Returns `SendFailed` for an unknown connection, otherwise whatever
    /// [`Connection::send_raw`] returns.
    pub async fn raw_notify_client(
        &self,
        id: ConnectionId,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        self.lookup(id)?.send_raw(bytes).await
    }

    /// Stop the server
    ///
    /// The listener is closed, then (unless in raw mode) every client is told
    /// the server is disconnecting. Finally the registry is cleared and every
    /// connection is shut down. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Stop accepting first so no connection slips past the clear below
        let listening = self.listening.lock().take();
        if let Some(listening) = listening {
            listening.shutdown_tx.send_replace(true);
            if let Err(e) = listening.accept_task.await {
                tracing::debug!(error = %e, "Accept task ended abnormally");
            }
        }

        if !self.raw_mode {
            let result = self
                .registry
                .broadcast_sentinel(Sentinel::ServerDisconnecting)
                .await;
            tracing::debug!(
                notified = result.successful,
                failed = result.failed,
                "Sent disconnect notice"
            );
        }

        for connection in self.registry.clear() {
            connection.shutdown().await;
        }

        tracing::info!(port = self.port, "Server disposed");
    }

    fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection<M, S>>, TransportError> {
        self.registry
            .get(id)
            .ok_or_else(|| TransportError::SendFailed(format!("Unknown connection: {id}")))
    }
}

impl<M, S> Server<M, S> {
    /// Connected client IDs, in id order
    #[must_use]
    pub fn clients(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    /// Number of connected clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Live connection set
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry<M, S> {
        &self.registry
    }

    /// Whether the accept loop is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_disposed() && self.listening.lock().is_some()
    }

    /// Whether [`dispose`](Self::dispose) has run
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Bound address while listening
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().as_ref().map(|l| l.local_addr)
    }

    /// Configured port (0 means ephemeral)
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections run in raw mode
    #[must_use]
    pub fn is_raw_mode(&self) -> bool {
        self.raw_mode
    }
}

impl<M, S> Drop for Server<M, S> {
    fn drop(&mut self) {
        if let Some(listening) = self.listening.get_mut().take() {
            listening.shutdown_tx.send_replace(true);
            listening.accept_task.abort();
        }
        for connection in self.registry.clear() {
            connection.abort();
        }
    }
}

impl<M, S> std::fmt::Debug for Server<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("local_addr", &self.local_addr())
            .field("raw_mode", &self.raw_mode)
            .field("clients", &self.client_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Everything the accept task needs
struct Acceptor<M, S> {
    listener: TcpListener,
    serializer: Arc<S>,
    raw_mode: bool,
    options: TransportOptions,
    registry: ConnectionRegistry<M, S>,
    events: EventHub<TransportEvent<M>>,
}

impl<M, S> Acceptor<M, S>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => {
                    tracing::warn!(error = %e, "Accept error");
                    self.events
                        .publish(&TransportEvent::error(None, TransportError::Io(e)));

                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.options.error_backoff()) => {}
                    }
                }
            }
        }

        tracing::debug!("Accept loop stopped");
    }

    fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let (connection, reader) = match Connection::new(
            stream,
            Arc::clone(&self.serializer),
            self.raw_mode,
            self.options.clone(),
            self.events.clone(),
        ) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to set up connection");
                self.events.publish(&TransportEvent::error(None, e));
                return;
            }
        };

        let id = connection.id();
        self.registry.insert(Arc::clone(&connection));
        tracing::info!(conn_id = %id, peer = %peer, "Client connected");
        self.events.publish(&TransportEvent::ClientAdded {
            connection: id,
            peer,
        });

        let registry = self.registry.clone();
        let events = self.events.clone();
        connection.start(reader, move |id| {
            registry.remove(id);
            tracing::info!(conn_id = %id, "Client removed");
            events.publish(&TransportEvent::ClientRemoved { connection: id });
        });
    }
}
