//! TCP Client
//!
//! Client role of the transport: one outbound [`Connection`] plus
//! connect-with-retry, connectivity-change detection and the orderly
//! disconnect handshake.
//!
//! # State machine
//!
//! ```text
//! Disconnected --reconnect()--> Connecting --stream--> Connected
//!      ^                            |                      |
//!      +------- deadline -----------+                      |
//!      +------------- stream ends / dispose() -------------+
//! ```
//!
//! `dispose` is terminal: a disposed client never connects again.
//!
//! # Connectivity watcher
//!
//! Every client owns a task that samples connectivity on a fixed tick and
//! publishes [`TransportEvent::ConnectionChanged`] only when it flips. It is
//! stopped by this client's `dispose` or drop and by nothing else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::constants::UNBOUNDED_WAIT;
use crate::serializer::{JsonSerializer, Serializer};

use super::connection::{Connection, ConnectionId, Sentinel};
use super::events::{EventHub, Subscription, TransportEvent};
use super::{ConnectionParameters, TransportError};

/// Connection state of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No live stream
    Disconnected,
    /// A reconnect is in progress
    Connecting,
    /// Stream is up
    Connected,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

type Slot<M, S> = Arc<parking_lot::Mutex<Option<Arc<Connection<M, S>>>>>;

/// Clears the connecting flag when a reconnect ends, even if cancelled
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single outbound connection with reconnect support
pub struct Client<M, S = JsonSerializer> {
    parameters: ConnectionParameters<S>,
    connection: Slot<M, S>,
    connecting: AtomicBool,
    disposed: AtomicBool,
    events: EventHub<TransportEvent<M>>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<M, S> Client<M, S>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serializer,
{
    /// Connect to the server named by `parameters`
    ///
    /// All-default parameters create an unconnected client that
    /// [`reconnect`](Self::reconnect) can bring up later.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the server cannot be reached.
    pub async fn connect(parameters: ConnectionParameters<S>) -> Result<Self, TransportError> {
        let client = Self::unconnected(parameters);
        if !client.parameters.is_valid() {
            tracing::debug!("Deferred connect: no server configured");
            return Ok(client);
        }

        let endpoint = client.parameters.endpoint();
        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{endpoint}: {e}")))?;
        client.attach(stream)?;

        Ok(client)
    }

    /// Keep trying to connect until `timeout` elapses
    ///
    /// `None` waits practically forever. Never fails: if no server answered
    /// in time the returned client is disconnected.
    pub async fn wait_for_server(
        parameters: ConnectionParameters<S>,
        timeout: Option<Duration>,
    ) -> Self {
        let client = Self::unconnected(parameters);
        let deadline = timeout.unwrap_or(UNBOUNDED_WAIT);

        if let Some(stream) = retry_connect(&client.parameters, deadline).await {
            if let Err(e) = client.attach(stream) {
                tracing::warn!(error = %e, "Failed to set up connection");
                client.events.publish(&TransportEvent::error(None, e));
            }
        }

        client
    }

    /// Re-establish the connection
    ///
    /// Returns `true` right away if already connected and `false` after
    /// [`dispose`](Self::dispose). Otherwise retries until `timeout`
    /// (default from `reconnect_timeout_ms`, one minute) and reports the
    /// resulting connectivity.
    pub async fn reconnect(&self, timeout: Option<Duration>) -> bool {
        if self.is_disposed() {
            return false;
        }
        if self.is_connected() {
            return true;
        }
        if self.connecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconnect already in progress");
            return false;
        }
        let _guard = ConnectingGuard(&self.connecting);

        let timeout = timeout.unwrap_or_else(|| self.parameters.options().reconnect_timeout());
        tracing::info!(
            endpoint = %self.parameters.endpoint(),
            timeout = ?timeout,
            "Reconnecting"
        );

        if let Some(stream) = retry_connect(&self.parameters, timeout).await {
            if self.is_disposed() {
                return false;
            }
            if let Err(e) = self.attach(stream) {
                tracing::warn!(error = %e, "Failed to set up connection");
                self.events.publish(&TransportEvent::error(None, e));
            }
        }

        self.is_connected()
    }

    /// Serialize and send a framed message
    ///
    /// # Errors
    ///
    /// `NotConnected` without a live connection, otherwise see
    /// [`Connection::send`].
    pub async fn send(&self, message: &M) -> Result<(), TransportError> {
        self.current()?.send(message).await
    }

    /// Send bytes without framing
    ///
    /// # Errors
    ///
    /// `NotConnected` without a live connection, otherwise see
    /// [`Connection::send_raw`].
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.current()?.send_raw(bytes).await
    }

    /// Disconnect for good
    ///
    /// Does nothing if already disposed or not connected. Otherwise tells
    /// the server (unless in raw mode), shuts the stream down and stops the
    /// connectivity watcher.
    pub async fn dispose(&self) {
        if !self.is_connected() || self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connection = self.connection.lock().clone();
        if let Some(connection) = connection {
            if !self.parameters.raw_mode() {
                if let Err(e) = connection
                    .send_sentinel(Sentinel::ClientDisconnecting)
                    .await
                {
                    tracing::debug!(error = %e, "Failed to send disconnect notice");
                }
            }
            connection.shutdown().await;
        }

        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }

        tracing::info!(endpoint = %self.parameters.endpoint(), "Client disposed");
    }

    /// Client with no stream and a running watcher
    fn unconnected(parameters: ConnectionParameters<S>) -> Self {
        let connection: Slot<M, S> = Arc::new(parking_lot::Mutex::new(None));
        let events = EventHub::new();
        let watcher = spawn_watcher(
            Arc::clone(&connection),
            events.clone(),
            parameters.options().connectivity_interval(),
        );

        Self {
            parameters,
            connection,
            connecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            events,
            watcher: parking_lot::Mutex::new(Some(watcher)),
        }
    }

    /// Wrap a fresh stream and start reading from it
    fn attach(&self, stream: TcpStream) -> Result<(), TransportError> {
        let (connection, reader) = Connection::new(
            stream,
            Arc::clone(self.parameters.serializer()),
            self.parameters.raw_mode(),
            self.parameters.options().clone(),
            self.events.clone(),
        )?;

        tracing::info!(
            conn_id = %connection.id(),
            peer = %connection.peer_addr(),
            raw = self.parameters.raw_mode(),
            "Connected"
        );

        connection.start(reader, |id| {
            tracing::info!(conn_id = %id, "Disconnected from server");
        });

        let previous = self.connection.lock().replace(connection);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    fn current(&self) -> Result<Arc<Connection<M, S>>, TransportError> {
        self.connection
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

impl<M, S> Client<M, S> {
    /// Subscribe to client events
    #[must_use]
    pub fn subscribe(&self) -> Subscription<TransportEvent<M>> {
        self.events.subscribe()
    }

    /// Whether a live stream exists
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ClientState {
        if self.connecting.load(Ordering::SeqCst) {
            ClientState::Connecting
        } else if self.is_connected() {
            ClientState::Connected
        } else {
            ClientState::Disconnected
        }
    }

    /// Whether [`dispose`](Self::dispose) has run
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Id of the current connection, if any
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.lock().as_ref().map(|c| c.id())
    }

    /// Server host name or address
    #[must_use]
    pub fn address(&self) -> &str {
        self.parameters.address()
    }

    /// Server port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.parameters.port()
    }

    /// Whether the client runs in raw mode
    #[must_use]
    pub fn raw_mode(&self) -> bool {
        self.parameters.raw_mode()
    }

    /// Parameters the client was created with
    #[must_use]
    pub fn parameters(&self) -> &ConnectionParameters<S> {
        &self.parameters
    }
}

impl<M, S> Drop for Client<M, S> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
        if let Some(connection) = self.connection.lock().take() {
            connection.abort();
        }
    }
}

impl<M, S: Serializer> std::fmt::Debug for Client<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("parameters", &self.parameters)
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Try to open a stream until `deadline` has passed
async fn retry_connect<S: Serializer>(
    parameters: &ConnectionParameters<S>,
    deadline: Duration,
) -> Option<TcpStream> {
    let options = parameters.options();
    let endpoint = parameters.endpoint();
    let start = Instant::now();
    let until = start
        .checked_add(deadline)
        .unwrap_or_else(|| start + UNBOUNDED_WAIT);
    let mut attempt = 0u32;

    loop {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        attempt += 1;

        let timeout = options.connect_attempt_timeout().min(remaining);
        match tokio::time::timeout(timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => {
                tracing::debug!(endpoint = %endpoint, attempt, "Connect attempt succeeded");
                return Some(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(endpoint = %endpoint, attempt, error = %e, "Connect attempt failed");
            }
            Err(_) => {
                tracing::debug!(endpoint = %endpoint, attempt, "Connect attempt timed out");
            }
        }

        let remaining = until.saturating_duration_since(Instant::now());
        tokio::time::sleep(options.retry_delay().min(remaining)).await;
    }

    tracing::info!(
        endpoint = %endpoint,
        attempts = attempt,
        elapsed = ?start.elapsed(),
        "Server did not answer before the deadline"
    );
    None
}

/// Publish `ConnectionChanged` whenever sampled connectivity flips
fn spawn_watcher<M, S>(
    connection: Slot<M, S>,
    events: EventHub<TransportEvent<M>>,
    interval: Duration,
) -> JoinHandle<()>
where
    M: Send + Sync + 'static,
    S: Serializer,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous = false;

        loop {
            ticker.tick().await;

            let current = connection
                .lock()
                .as_ref()
                .is_some_and(|c| c.is_connected());
            if current != previous {
                previous = current;
                tracing::debug!(connected = current, "Connectivity changed");
                events.publish(&TransportEvent::ConnectionChanged { connected: current });
            }
        }
    })
}
