//! Transport Layer
//!
//! Everything between a serialized value and a TCP socket:
//!
//! - [`frame`]: `[u32 length][payload]` codec and the streaming decoder
//! - [`connection`]: one stream, its read loop and its send paths
//! - [`client`]: outbound role with retry, reconnect and connectivity events
//! - [`server`]: listening role with a [`ConnectionRegistry`] and broadcast
//! - [`events`]: [`TransportEvent`]s and the subscription hub
//! - [`config`]: [`ConnectionParameters`] and [`TransportOptions`]
//!
//! # Security
//!
//! There is none at this layer: no authentication, no encryption and, by
//! default, no bound on announced frame lengths. Servers bind all interfaces.
//! Use `max_frame_len` and a trusted network.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod frame;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use client::{Client, ClientState};
pub use config::{ConfigError, ConnectionParameters, TransportOptions};
pub use connection::{Connection, ConnectionId};
pub use error::TransportError;
pub use events::{EventHub, Payload, Subscription, TransportEvent};
pub use frame::FrameDecoder;
pub use registry::{BroadcastResult, ConnectionRegistry};
pub use server::Server;
