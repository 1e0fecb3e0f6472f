//! Peer abstraction for Junction.
//!
//! A peer is one end of a message stream. The router never touches sockets:
//! transports pump their connection through a [`ChannelPeer`] and hand the
//! peer to [`Router::accept`](crate::Router::accept).

use async_trait::async_trait;
use junction_protocol::Message;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Default capacity of a peer's outbound queue.
pub const DEFAULT_PEER_CAPACITY: usize = 256;

/// Peer errors.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The other side is gone.
    #[error("Peer connection closed")]
    Closed,

    /// The outbound queue has no free slot.
    #[error("Peer outbound queue is full")]
    Full,
}

/// Cloneable outbound capability of a peer.
///
/// Routing tables hold these rather than the peer itself.
#[derive(Debug, Clone)]
pub struct PeerSender {
    tx: mpsc::Sender<Message>,
}

impl PeerSender {
    /// Wrap the sending side of a peer's outbound queue.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Queue a message for the peer, waiting if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Closed`] if the peer no longer accepts messages.
    pub async fn send(&self, message: Message) -> Result<(), PeerError> {
        self.tx.send(message).await.map_err(|_| PeerError::Closed)
    }

    /// Queue a message for the peer without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Full`] if the queue has no free slot and
    /// [`PeerError::Closed`] if the peer no longer accepts messages.
    pub fn try_send(&self, message: Message) -> Result<(), PeerError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::Full,
            mpsc::error::TrySendError::Closed(_) => PeerError::Closed,
        })
    }

    /// Check whether the peer stopped accepting messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the peer stops accepting messages.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// A bidirectional message peer.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Get a handle for sending to this peer.
    fn sender(&self) -> PeerSender;

    /// Send a message to the peer.
    async fn send(&self, message: Message) -> Result<(), PeerError> {
        self.sender().send(message).await
    }

    /// Receive the next inbound message.
    ///
    /// Returns `None` once the connection has ended.
    async fn recv(&mut self) -> Option<Message>;

    /// Close the peer. Calling this more than once has no further effect.
    async fn close(&mut self) -> Result<(), PeerError>;

    /// Get the remote address of the peer, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// The transport-facing half of a [`ChannelPeer`].
///
/// A transport drains `outgoing` into its socket, feeds decoded messages
/// into `incoming`, and stops both directions once `shutdown` turns `true`.
#[derive(Debug)]
pub struct PeerIo {
    /// Messages the router wants written to the connection.
    pub outgoing: mpsc::Receiver<Message>,
    /// Messages read from the connection.
    pub incoming: mpsc::Sender<Message>,
    /// Flipped to `true` when the peer is closed.
    pub shutdown: watch::Receiver<bool>,
}

/// A peer backed by in-memory queues.
#[derive(Debug)]
pub struct ChannelPeer {
    sender: PeerSender,
    incoming: mpsc::Receiver<Message>,
    shutdown: watch::Sender<bool>,
    remote_addr: Option<String>,
}

impl ChannelPeer {
    /// Create a peer together with the handles a transport pumps.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, PeerIo) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let peer = Self::from_parts(out_tx, in_rx);
        let io = PeerIo {
            outgoing: out_rx,
            incoming: in_tx,
            shutdown: peer.shutdown.subscribe(),
        };
        (peer, io)
    }

    fn from_parts(outgoing: mpsc::Sender<Message>, incoming: mpsc::Receiver<Message>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sender: PeerSender::new(outgoing),
            incoming,
            shutdown,
            remote_addr: None,
        }
    }

    /// Attach the remote address reported by the transport.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Check whether [`Peer::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[async_trait]
impl Peer for ChannelPeer {
    fn sender(&self) -> PeerSender {
        self.sender.clone()
    }

    async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        if self.shutdown.send_replace(true) {
            return Ok(()); // Already closed
        }
        self.incoming.close();
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// Create two linked peers: messages sent on one are received by the other.
///
/// Useful for in-process clients and tests.
#[must_use]
pub fn pipe(capacity: usize) -> (ChannelPeer, ChannelPeer) {
    let (a_to_b, b_incoming) = mpsc::channel(capacity);
    let (b_to_a, a_incoming) = mpsc::channel(capacity);
    (
        ChannelPeer::from_parts(a_to_b, a_incoming),
        ChannelPeer::from_parts(b_to_a, b_incoming),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_delivers_both_ways() {
        let (mut a, mut b) = pipe(4);

        a.send(Message::subscribe(1, "topic")).await.unwrap();
        assert_eq!(b.recv().await, Some(Message::subscribe(1, "topic")));

        b.send(Message::goodbye_and_out()).await.unwrap();
        assert_eq!(a.recv().await, Some(Message::goodbye_and_out()));
    }

    #[tokio::test]
    async fn test_recv_ends_when_senders_drop() {
        let (mut a, b) = pipe(4);
        drop(b);
        assert_eq!(a.recv().await, None);
        assert!(a.send(Message::goodbye_and_out()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut peer, mut io) = ChannelPeer::new(4);
        assert!(!peer.is_closed());

        peer.close().await.unwrap();
        peer.close().await.unwrap();

        assert!(peer.is_closed());
        assert!(*io.shutdown.borrow_and_update());
        assert!(io.incoming.send(Message::goodbye_and_out()).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_peer_io() {
        let (mut peer, mut io) = ChannelPeer::new(4);
        let peer_addr = "127.0.0.1:9000";
        peer = peer.with_remote_addr(peer_addr);

        peer.send(Message::abort("wamp.error.timeout")).await.unwrap();
        assert_eq!(
            io.outgoing.recv().await,
            Some(Message::abort("wamp.error.timeout"))
        );

        io.incoming.send(Message::publish(3, "t")).await.unwrap();
        assert_eq!(peer.recv().await, Some(Message::publish(3, "t")));
        assert_eq!(peer.remote_addr().as_deref(), Some(peer_addr));
    }

    #[tokio::test]
    async fn test_sender_closed_resolves_when_transport_stops() {
        let (peer, io) = ChannelPeer::new(4);
        let sender = peer.sender();

        let waiter = tokio::spawn(async move { sender.closed().await });
        drop(io);

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_try_send_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let sender = PeerSender::new(tx);

        sender.try_send(Message::goodbye_and_out()).unwrap();
        assert!(matches!(
            sender.try_send(Message::goodbye_and_out()),
            Err(PeerError::Full)
        ));

        drop(rx);
        assert!(matches!(
            sender.try_send(Message::goodbye_and_out()),
            Err(PeerError::Closed)
        ));
    }
}
