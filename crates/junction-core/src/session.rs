//! Per-connection session state.

use crate::id::RequestIds;
use crate::peer::{Peer, PeerError, PeerSender};
use dashmap::DashMap;
use junction_protocol::{Dict, Id, Message, Uri};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Session side table shared by a realm and its broker and dealer.
pub type SessionTable = DashMap<Id, SessionHandle>;

/// What routing tables know about a session: its id and how to reach it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Id,
    sender: PeerSender,
    request_ids: Arc<RequestIds>,
}

impl SessionHandle {
    /// Create a handle with a fresh request id counter.
    #[must_use]
    pub fn new(id: Id, sender: PeerSender) -> Self {
        Self {
            id,
            sender,
            request_ids: Arc::new(RequestIds::new()),
        }
    }

    /// Get the session id.
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Get the outbound sender.
    #[must_use]
    pub fn sender(&self) -> &PeerSender {
        &self.sender
    }

    /// Draw the next request id scoped to this session.
    #[must_use]
    pub fn next_request_id(&self) -> Id {
        self.request_ids.next_id()
    }

    /// Send a message to the session's peer.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Closed`] if the peer is gone.
    pub async fn send(&self, message: Message) -> Result<(), PeerError> {
        self.sender.send(message).await
    }

    /// Queue a message for the session's peer without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Full`] or [`PeerError::Closed`] when the
    /// message could not be queued.
    pub fn try_send(&self, message: Message) -> Result<(), PeerError> {
        self.sender.try_send(message)
    }
}

/// Send a reply, ignoring peers that already left.
pub(crate) async fn reply(session: &SessionHandle, message: Message) {
    if session.send(message).await.is_err() {
        trace!(session = session.id(), "Dropped reply for closed session");
    }
}

/// A welcomed session, owned by its dispatch loop.
pub(crate) struct Session {
    pub(crate) handle: SessionHandle,
    pub(crate) realm: Uri,
    pub(crate) details: Dict,
    pub(crate) peer: Box<dyn Peer>,
    /// Forced-disconnect signal carrying the goodbye reason.
    pub(crate) kill: mpsc::Receiver<Uri>,
}

impl Session {
    pub(crate) fn id(&self) -> Id {
        self.handle.id()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.handle.id())
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_send_and_request_ids() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = SessionHandle::new(9, PeerSender::new(tx));

        assert_eq!(handle.id(), 9);
        assert_eq!(handle.next_request_id(), 1);

        // Clones share the counter
        let copy = handle.clone();
        assert_eq!(copy.next_request_id(), 2);

        handle.send(Message::goodbye_and_out()).await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::goodbye_and_out()));

        drop(rx);
        assert!(handle.sender().is_closed());
        assert!(handle.send(Message::goodbye_and_out()).await.is_err());
    }
}
