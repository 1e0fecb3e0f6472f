//! Helpers shared by the unit tests of this crate.

use crate::peer::PeerSender;
use crate::session::{SessionHandle, SessionTable};
use junction_protocol::{Id, Message};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long tests wait for a message that must arrive.
pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// How long tests wait before concluding nothing will arrive.
pub(crate) const IDLE_WINDOW: Duration = Duration::from_millis(50);

/// Register a session in `table` and return its handle and outbound queue.
pub(crate) fn join(table: &SessionTable, id: Id) -> (SessionHandle, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = SessionHandle::new(id, PeerSender::new(tx));
    table.insert(id, handle.clone());
    (handle, rx)
}

/// Receive the next message or fail the test.
pub(crate) async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

/// Fail the test if a message arrives within the idle window.
pub(crate) async fn assert_idle(rx: &mut mpsc::Receiver<Message>) {
    if let Ok(Some(message)) = tokio::time::timeout(IDLE_WINDOW, rx.recv()).await {
        panic!("unexpected message: {:?}", message);
    }
}
