//! The router: realm registry, connection handshake and per-session
//! dispatch.

use crate::id::new_id;
use crate::peer::{Peer, PeerError};
use crate::realm::{AuthOutcome, AuthenticationError, Realm};
use crate::session::{reply, Session, SessionHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use junction_protocol::messages::{Challenge, Welcome};
use junction_protocol::{reason, Dict, Id, Message, MessageType, Uri};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Agent string advertised in WELCOME details.
pub const DEFAULT_AGENT: &str = concat!("junction-", env!("CARGO_PKG_VERSION"));

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A realm with this URI is already registered.
    #[error("Realm exists: {0}")]
    RealmExists(Uri),

    /// The router is shutting down.
    #[error("Router is closing")]
    Closing,

    /// The peer did not send the expected message in time.
    #[error("Timed out waiting for {0}")]
    Timeout(MessageType),

    /// The peer disconnected before the handshake finished.
    #[error("Connection closed during handshake")]
    HandshakeClosed,

    /// The peer sent the wrong message during the handshake.
    #[error("Unexpected message: {received}; expected {expected}")]
    UnexpectedMessage {
        received: MessageType,
        expected: MessageType,
    },

    /// HELLO named a realm that is not registered.
    #[error("No such realm: {0}")]
    NoSuchRealm(Uri),

    /// Authentication failed.
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// Sending to the peer failed.
    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl RouterError {
    /// The ABORT sent to a peer whose handshake failed with this error.
    ///
    /// `None` when there is nobody left to tell.
    #[must_use]
    pub fn abort_message(&self) -> Option<Message> {
        let message = match self {
            RouterError::Closing => Message::abort(reason::SYSTEM_SHUTDOWN),
            RouterError::Timeout(_) => Message::abort_with_message(reason::TIMEOUT, self.to_string()),
            RouterError::UnexpectedMessage { .. } => {
                Message::abort_with_message(reason::NOT_AUTHORIZED, self.to_string())
            }
            RouterError::NoSuchRealm(_) => Message::abort(reason::NO_SUCH_REALM),
            RouterError::Authentication(err) => {
                Message::abort_with_message(err.reason(), err.to_string())
            }
            RouterError::RealmExists(_) | RouterError::HandshakeClosed | RouterError::Peer(_) => {
                return None
            }
        };
        Some(message)
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long to wait for HELLO.
    pub handshake_timeout: Duration,
    /// How long to wait for AUTHENTICATE after sending CHALLENGE.
    pub authenticate_timeout: Duration,
    /// Agent string advertised in WELCOME.
    pub agent: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            authenticate_timeout: Duration::from_secs(5),
            agent: DEFAULT_AGENT.to_string(),
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of registered realms.
    pub realm_count: usize,
    /// Number of live sessions across all realms.
    pub session_count: usize,
}

/// The central router.
///
/// Owns the realm registry and the forced-disconnect switch of every live
/// session. Each welcomed session runs its own dispatch task.
pub struct Router {
    realms: DashMap<Uri, Arc<Realm>>,
    /// Kill switches of live sessions.
    sessions: DashMap<Id, mpsc::Sender<Uri>>,
    closing: AtomicBool,
    config: RouterConfig,
}

impl Router {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            realms: DashMap::new(),
            sessions: DashMap::new(),
            closing: AtomicBool::new(false),
            config,
        }
    }

    /// Get the router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            realm_count: self.realms.len(),
            session_count: self.sessions.len(),
        }
    }

    /// Check whether [`Router::close`] has been called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Register a realm.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::RealmExists`] if the URI is taken.
    pub fn register_realm(&self, realm: Realm) -> Result<(), RouterError> {
        match self.realms.entry(realm.uri().clone()) {
            Entry::Occupied(entry) => Err(RouterError::RealmExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!(realm = %realm.uri(), "Registered realm");
                entry.insert(Arc::new(realm));
                Ok(())
            }
        }
    }

    /// Look up a registered realm.
    #[must_use]
    pub fn realm(&self, uri: &str) -> Option<Arc<Realm>> {
        self.realms.get(uri).map(|realm| Arc::clone(realm.value()))
    }

    /// Run the handshake on a new peer and start its session.
    ///
    /// Returns the session id once WELCOME has been sent. On failure the
    /// peer receives an ABORT (when it is still there) and is closed.
    ///
    /// # Errors
    ///
    /// Returns the reason the handshake failed.
    pub async fn accept(self: &Arc<Self>, mut peer: Box<dyn Peer>) -> Result<Id, RouterError> {
        let (realm, welcome) = match self.handshake(peer.as_mut()).await {
            Ok(joined) => joined,
            Err(err) => {
                debug!(error = %err, "Handshake failed");
                abort(peer.as_mut(), &err).await;
                return Err(err);
            }
        };

        let id = new_id();
        let handle = SessionHandle::new(id, peer.sender());
        let (kill_tx, kill_rx) = mpsc::channel(1);

        realm.join(handle.clone());
        self.sessions.insert(id, kill_tx);

        // close() may have run after the handshake and missed this session
        if self.is_closing() {
            self.sessions.remove(&id);
            realm.leave(id).await;
            let err = RouterError::Closing;
            abort(peer.as_mut(), &err).await;
            return Err(err);
        }

        let details = self.welcome_details(welcome);
        let message = Message::Welcome(Welcome {
            session: id,
            details: details.clone(),
        });
        if let Err(err) = handle.send(message).await {
            self.sessions.remove(&id);
            realm.leave(id).await;
            let _ = peer.close().await;
            return Err(err.into());
        }

        info!(
            session = id,
            realm = %realm.uri(),
            remote = peer.remote_addr().as_deref().unwrap_or("local"),
            "Session established"
        );

        let session = Session {
            handle,
            realm: realm.uri().clone(),
            details,
            peer,
            kill: kill_rx,
        };
        tokio::spawn(Arc::clone(self).handle_session(session, realm));

        Ok(id)
    }

    /// Shut the router down.
    ///
    /// Later handshakes are refused and every live session is told
    /// `wamp.error.system_shutdown`.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(sessions = self.sessions.len(), "Closing router");
        for entry in self.sessions.iter() {
            // A full slot means the session is already being killed.
            let _ = entry.value().try_send(Uri::from(reason::SYSTEM_SHUTDOWN));
        }
    }

    async fn handshake(&self, peer: &mut dyn Peer) -> Result<(Arc<Realm>, Dict), RouterError> {
        if self.is_closing() {
            return Err(RouterError::Closing);
        }

        let hello = match expect(peer, MessageType::Hello, self.config.handshake_timeout).await? {
            Message::Hello(hello) => hello,
            other => {
                return Err(RouterError::UnexpectedMessage {
                    received: other.message_type(),
                    expected: MessageType::Hello,
                })
            }
        };

        let realm = self
            .realm(hello.realm.as_str())
            .ok_or_else(|| RouterError::NoSuchRealm(hello.realm.clone()))?;

        let welcome = match realm.authenticate(&hello.details)? {
            AuthOutcome::Welcome(details) => details,
            AuthOutcome::Challenge { method, extra } => {
                trace!(realm = %realm.uri(), method = %method, "Challenging peer");
                peer.send(Message::Challenge(Challenge {
                    auth_method: method.clone(),
                    extra: extra.clone(),
                }))
                .await?;

                let timeout = self.config.authenticate_timeout;
                let authenticate = match expect(peer, MessageType::Authenticate, timeout).await? {
                    Message::Authenticate(authenticate) => authenticate,
                    other => {
                        return Err(RouterError::UnexpectedMessage {
                            received: other.message_type(),
                            expected: MessageType::Authenticate,
                        })
                    }
                };
                realm.verify(&method, &extra, &authenticate.signature)?
            }
        };

        Ok((realm, welcome))
    }

    fn welcome_details(&self, mut details: Dict) -> Dict {
        details.entry("roles").or_insert_with(|| {
            serde_json::json!({
                "broker": {},
                "dealer": {},
            })
        });
        details
            .entry("agent")
            .or_insert_with(|| Value::from(self.config.agent.clone()));
        details
    }

    async fn handle_session(self: Arc<Self>, mut session: Session, realm: Arc<Realm>) {
        let id = session.id();

        loop {
            let message = tokio::select! {
                message = session.peer.recv() => message,
                Some(reason) = session.kill.recv() => {
                    debug!(session = id, reason = %reason, "Killing session");
                    reply(&session.handle, Message::goodbye(reason)).await;
                    break;
                }
            };

            let Some(message) = message else {
                debug!(session = id, "Peer disconnected");
                break;
            };

            match message {
                Message::Goodbye(goodbye) => {
                    debug!(session = id, reason = %goodbye.reason, "Peer said goodbye");
                    reply(&session.handle, Message::goodbye_and_out()).await;
                    break;
                }
                message => self.route(&session, &realm, message).await,
            }
        }

        realm.leave(id).await;
        self.sessions.remove(&id);
        let _ = session.peer.close().await;
        info!(session = id, realm = %session.realm, "Session closed");
    }

    async fn route(&self, session: &Session, realm: &Realm, message: Message) {
        let handle = &session.handle;
        trace!(session = handle.id(), message_type = %message.message_type(), "Routing");

        if requires_authorization(&message)
            && !realm.authorize(handle.id(), &message, &session.details)
        {
            debug!(
                session = handle.id(),
                message_type = %message.message_type(),
                "Request not authorized"
            );
            let request = message.request_id().unwrap_or_default();
            let error = Message::error(message.message_type(), request, reason::NOT_AUTHORIZED);
            reply(handle, error).await;
            return;
        }

        match message {
            Message::Publish(msg) => realm.broker().publish(handle, msg).await,
            Message::Subscribe(msg) => realm.broker().subscribe(handle, msg).await,
            Message::Unsubscribe(msg) => realm.broker().unsubscribe(handle, msg).await,
            Message::Register(msg) => realm.dealer().register(handle, msg).await,
            Message::Unregister(msg) => realm.dealer().unregister(handle, msg).await,
            Message::Call(msg) => realm.dealer().call(handle, msg).await,
            Message::Yield(msg) => realm.dealer().yield_result(handle, msg).await,
            Message::Error(msg) if msg.request_type == MessageType::Invocation => {
                realm.dealer().error(handle, msg).await;
            }
            other => {
                warn!(
                    session = handle.id(),
                    message_type = %other.message_type(),
                    "Dropping unexpected message"
                );
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("realms", &self.realms.len())
            .field("sessions", &self.sessions.len())
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

fn requires_authorization(message: &Message) -> bool {
    matches!(
        message,
        Message::Publish(_)
            | Message::Subscribe(_)
            | Message::Unsubscribe(_)
            | Message::Call(_)
            | Message::Register(_)
            | Message::Unregister(_)
    )
}

/// Wait for the next handshake message.
async fn expect(
    peer: &mut dyn Peer,
    expected: MessageType,
    wait: Duration,
) -> Result<Message, RouterError> {
    match timeout(wait, peer.recv()).await {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(RouterError::HandshakeClosed),
        Err(_) => Err(RouterError::Timeout(expected)),
    }
}

async fn abort(peer: &mut dyn Peer, err: &RouterError) {
    if let Some(message) = err.abort_message() {
        let _ = peer.send(message).await;
    }
    let _ = peer.close().await;
}
