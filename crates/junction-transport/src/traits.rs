//! Transport abstraction traits for Junction.
//!
//! A transport owns a listener and turns each accepted connection into a
//! core [`Peer`], so the router never sees sockets or encodings.

use async_trait::async_trait;
use junction_core::Peer;
use junction_protocol::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    Closed,

    /// The connection-level handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can accept peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept the next connection and complete its transport handshake.
    ///
    /// The returned peer is ready to be handed to the router.
    async fn accept(&self) -> Result<Box<dyn Peer>, TransportError>;

    /// Get the transport name (e.g., "websocket", "rawsocket").
    fn name(&self) -> &'static str;

    /// Get the local address the transport listens on.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
