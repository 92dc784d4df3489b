//! Protocol Constants
//!
//! Defaults shared by the client and server roles, and the two control
//! values that travel in-band as ordinary frames.

use std::time::Duration;

/// Default TCP port for both roles
pub const DEFAULT_PORT: u16 = 888;

/// Receive buffer size for raw mode (30,000,000 bytes)
///
/// A raw read never delivers more than this many bytes at once.
pub const RAW_BUFFER_SIZE: usize = 3 * 10_000_000;

/// Size of the frame length prefix
pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<u32>();

/// Back-off after a read or accept error before the loop retries
pub const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// How long a single connect attempt may take inside the retry loop
pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);

/// Sleep between two connect attempts inside the retry loop
pub const RETRY_DELAY: Duration = Duration::from_millis(150);

/// Tick of the per-client connectivity watcher
pub const CONNECTIVITY_INTERVAL: Duration = Duration::from_millis(500);

/// Default deadline for [`Client::reconnect`](crate::Client::reconnect)
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline used by `wait_for_server` when the caller gives none
///
/// One year is as good as unbounded for a retry loop and still fits in an
/// `Instant` on every supported platform.
pub const UNBOUNDED_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Sentinel a client sends before closing its side of the connection
pub const CLIENT_DISCONNECTING: &str = "79BFCD0C-77BB-45E9-89A3-CC3447B5980D";

/// Sentinel a server broadcasts before it stops
pub const SERVER_DISCONNECTING: &str = "0E621D2C-3F3D-4F3D-8CBC-C847D1206472";
