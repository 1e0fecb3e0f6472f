//! # junction-transport
//!
//! Transport layer for the Junction router.
//!
//! Each transport accepts connections, negotiates a serialization and hands
//! the router a [`junction_core::Peer`]:
//!
//! - **WebSocket** - `wamp.2.json` and `wamp.2.msgpack` subprotocols
//! - **Raw socket** - Length-prefixed frames over plain TCP
//!
//! ```rust,ignore
//! use junction_transport::{Transport, WebSocketTransport};
//!
//! let transport = WebSocketTransport::bind("127.0.0.1:8080".parse()?).await?;
//! loop {
//!     let peer = transport.accept().await?;
//!     router.accept(peer).await?;
//! }
//! ```

pub mod telemetry;
pub mod traits;

#[cfg(feature = "rawsocket")]
pub mod rawsocket;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Transport, TransportError};

#[cfg(feature = "rawsocket")]
pub use rawsocket::{RawSocketConfig, RawSocketTransport};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
