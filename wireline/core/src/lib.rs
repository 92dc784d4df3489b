//! Wireline Core - Length-Prefixed Message Transport over TCP
//!
//! This crate moves serialized values between processes over plain TCP
//! sockets. It frames each value with a 4-byte length prefix, publishes what
//! arrives to subscribers, and owns connection lifecycle for both roles:
//!
//! - [`Client`]: one outbound connection with connect-with-retry,
//!   connectivity-change detection and an orderly disconnect handshake
//! - [`Server`]: a listener that tracks every accepted connection, broadcasts
//!   to them, and reports joins and leaves
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐                                   ┌──────────────────────┐
//! │    Client    │          TCP  [len][payload]      │        Server        │
//! │              ├──────────────────────────────────►│  ConnectionRegistry  │
//! │  Connection ─┤                                   ├─ conn-1  Connection  │
//! │  (read task) │◄──────────────────────────────────┤─ conn-2  Connection  │
//! └──────┬───────┘                                   └──────────┬───────────┘
//!        │ Subscription<TransportEvent<M>>                      │
//!        ▼                                                      ▼
//!   application                                           application
//! ```
//!
//! A value travels `Serializer -> frame::encode -> socket`; inbound bytes go
//! `socket -> frame header -> Serializer -> TransportEvent::MessageReceived`.
//! Raw mode skips both the serializer and the framing.
//!
//! # Quick Start
//!
//! ```ignore
//! use wireline_core::{Client, ConnectionParameters, Payload, Server, TransportEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wireline_core::TransportError> {
//!     let server = Server::<String>::start_new(Default::default(), 9000).await?;
//!     let mut events = server.subscribe();
//!
//!     let client = Client::<String>::connect(ConnectionParameters::new("127.0.0.1").with_port(9000)).await?;
//!     client.send(&"hello".to_string()).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let TransportEvent::MessageReceived { payload: Payload::Message(text), .. } = event {
//!             println!("got {text}");
//!             break;
//!         }
//!     }
//!
//!     server.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`constants`]: default port, buffer sizes, intervals and the control sentinels
//! - [`serializer`]: the serializer capability and the bundled codecs
//! - [`transport`]: framing, connections, events, client, server and registry

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod serializer;
pub mod transport;

// Re-exports for convenience
#[cfg(feature = "bincode")]
pub use serializer::BinarySerializer;
#[cfg(feature = "msgpack")]
pub use serializer::MessagePackSerializer;
pub use serializer::{JsonSerializer, SerializationError, Serializer};
pub use transport::{
    BroadcastResult, Client, ClientState, ConfigError, Connection, ConnectionId,
    ConnectionParameters, ConnectionRegistry, EventHub, Payload, Server, Subscription,
    TransportError, TransportEvent, TransportOptions,
};
