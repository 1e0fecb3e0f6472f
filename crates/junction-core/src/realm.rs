//! Realms: named namespaces owning a broker, a dealer and an
//! authentication policy.

use crate::auth::{AllowAll, AuthError, Authenticator, Authorizer, ChallengeAuthenticator};
use crate::broker::Broker;
use crate::dealer::Dealer;
use crate::session::{SessionHandle, SessionTable};
use junction_protocol::{reason, Dict, Id, Message, Uri};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why a HELLO could not be authenticated.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// None of the methods the peer proposed is configured.
    #[error("could not authenticate with any method")]
    NoMatchingMethod,

    /// The selected authenticator rejected the peer.
    #[error("{method} authentication failed: {source}")]
    Failed {
        method: String,
        #[source]
        source: AuthError,
    },
}

impl AuthenticationError {
    /// The ABORT reason sent to the peer.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AuthenticationError::NoMatchingMethod => reason::NO_AUTH_METHOD,
            AuthenticationError::Failed { .. } => reason::AUTHENTICATION_FAILED,
        }
    }
}

/// Result of the first authentication step.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// The peer is in; carries the WELCOME details.
    Welcome(Dict),
    /// The peer must answer a challenge.
    Challenge { method: String, extra: Dict },
}

enum AuthMethod {
    Single(Box<dyn Authenticator>),
    ChallengeResponse(Box<dyn ChallengeAuthenticator>),
}

/// A named routing namespace.
///
/// Authenticators and the authorizer are fixed once the realm is
/// registered with a router; broker and dealer state changes freely.
pub struct Realm {
    uri: Uri,
    authenticators: HashMap<String, AuthMethod>,
    authorizer: Box<dyn Authorizer>,
    sessions: Arc<SessionTable>,
    broker: Broker,
    dealer: Dealer,
}

impl Realm {
    /// Create an open realm: no authenticators, everything authorized.
    #[must_use]
    pub fn new(uri: impl Into<Uri>) -> Self {
        let sessions = Arc::new(SessionTable::new());
        Self {
            uri: uri.into(),
            authenticators: HashMap::new(),
            authorizer: Box::new(AllowAll),
            broker: Broker::new(Arc::clone(&sessions)),
            dealer: Dealer::new(Arc::clone(&sessions)),
            sessions,
        }
    }

    /// Add a single-shot authenticator under `method`.
    #[must_use]
    pub fn with_authenticator(
        mut self,
        method: impl Into<String>,
        authenticator: impl Authenticator + 'static,
    ) -> Self {
        self.authenticators
            .insert(method.into(), AuthMethod::Single(Box::new(authenticator)));
        self
    }

    /// Add a challenge/response authenticator under `method`.
    #[must_use]
    pub fn with_challenge_authenticator(
        mut self,
        method: impl Into<String>,
        authenticator: impl ChallengeAuthenticator + 'static,
    ) -> Self {
        self.authenticators.insert(
            method.into(),
            AuthMethod::ChallengeResponse(Box::new(authenticator)),
        );
        self
    }

    /// Replace the authorizer.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Box::new(authorizer);
        self
    }

    /// Get the realm URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Get the realm's broker.
    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Get the realm's dealer.
    #[must_use]
    pub fn dealer(&self) -> &Dealer {
        &self.dealer
    }

    /// Number of sessions currently joined.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start authenticating a HELLO.
    ///
    /// A realm without authenticators welcomes everyone. Otherwise the
    /// methods listed in `authmethods` are tried in the peer's order and the
    /// first configured one decides.
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationError::NoMatchingMethod`] when no proposed
    /// method is configured, or [`AuthenticationError::Failed`] when the
    /// selected authenticator rejects the peer.
    pub fn authenticate(&self, details: &Dict) -> Result<AuthOutcome, AuthenticationError> {
        if self.authenticators.is_empty() {
            return Ok(AuthOutcome::Welcome(Dict::new()));
        }

        let proposed = details
            .get("authmethods")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);

        for method in proposed {
            let failed = |source| AuthenticationError::Failed {
                method: method.to_string(),
                source,
            };
            match self.authenticators.get(method) {
                Some(AuthMethod::Single(authenticator)) => {
                    let welcome = authenticator.authenticate(details).map_err(failed)?;
                    return Ok(AuthOutcome::Welcome(tag_method(welcome, method)));
                }
                Some(AuthMethod::ChallengeResponse(authenticator)) => {
                    let extra = authenticator.challenge(details).map_err(failed)?;
                    return Ok(AuthOutcome::Challenge {
                        method: method.to_string(),
                        extra,
                    });
                }
                None => {}
            }
        }

        Err(AuthenticationError::NoMatchingMethod)
    }

    /// Check the signature a peer returned for a challenge.
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationError::NoMatchingMethod`] if `method` is not a
    /// challenge/response method of this realm, or
    /// [`AuthenticationError::Failed`] if the signature is rejected.
    pub fn verify(
        &self,
        method: &str,
        challenge: &Dict,
        signature: &str,
    ) -> Result<Dict, AuthenticationError> {
        let Some(AuthMethod::ChallengeResponse(authenticator)) = self.authenticators.get(method)
        else {
            return Err(AuthenticationError::NoMatchingMethod);
        };
        let welcome = authenticator
            .verify(challenge, signature)
            .map_err(|source| AuthenticationError::Failed {
                method: method.to_string(),
                source,
            })?;
        Ok(tag_method(welcome, method))
    }

    /// Ask the authorizer whether a session may perform a request.
    #[must_use]
    pub fn authorize(&self, session: Id, message: &Message, details: &Dict) -> bool {
        self.authorizer.authorize(session, message, details)
    }

    /// Add a welcomed session to the realm.
    pub fn join(&self, session: SessionHandle) {
        debug!(realm = %self.uri, session = session.id(), "Session joined");
        self.sessions.insert(session.id(), session);
    }

    /// Remove a session and everything it owns in the broker and dealer.
    ///
    /// Returns `false` if the session was not joined.
    pub async fn leave(&self, session: Id) -> bool {
        if self.sessions.remove(&session).is_none() {
            return false;
        }
        self.broker.remove_session(session).await;
        self.dealer.remove_session(session).await;
        debug!(realm = %self.uri, session, "Session left");
        true
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.authenticators.keys().map(String::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("Realm")
            .field("uri", &self.uri)
            .field("authmethods", &methods)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

fn tag_method(mut details: Dict, method: &str) -> Dict {
    details.insert("authmethod".to_string(), Value::from(method));
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TicketAuthenticator;
    use crate::test_support::{join, next};
    use junction_protocol::messages::{Register, Subscribe};
    use serde_json::json;

    struct UserAuthenticator;

    impl Authenticator for UserAuthenticator {
        fn authenticate(&self, details: &Dict) -> Result<Dict, AuthError> {
            match details.get("authid").and_then(Value::as_str) {
                Some("alice") => {
                    let mut welcome = Dict::new();
                    welcome.insert("authrole".to_string(), json!("admin"));
                    Ok(welcome)
                }
                Some(other) => Err(AuthError::Rejected(format!("unknown user {other}"))),
                None => Err(AuthError::MissingDetail("authid")),
            }
        }
    }

    fn details(value: Value) -> Dict {
        match value {
            Value::Object(map) => map,
            _ => Dict::new(),
        }
    }

    #[test]
    fn test_open_realm_welcomes_anyone() {
        let realm = Realm::new("realm1");
        assert_eq!(
            realm.authenticate(&Dict::new()).unwrap(),
            AuthOutcome::Welcome(Dict::new())
        );
    }

    #[test]
    fn test_single_shot_authentication() {
        let realm = Realm::new("realm1").with_authenticator("user", UserAuthenticator);

        let outcome = realm
            .authenticate(&details(json!({"authmethods": ["user"], "authid": "alice"})))
            .unwrap();
        match outcome {
            AuthOutcome::Welcome(welcome) => {
                assert_eq!(welcome["authmethod"], "user");
                assert_eq!(welcome["authrole"], "admin");
            }
            other => panic!("Expected Welcome, got {:?}", other),
        }

        let err = realm
            .authenticate(&details(json!({"authmethods": ["user"], "authid": "mallory"})))
            .unwrap_err();
        assert_eq!(err.reason(), reason::AUTHENTICATION_FAILED);
    }

    #[test]
    fn test_no_matching_method() {
        let realm = Realm::new("realm1").with_authenticator("user", UserAuthenticator);

        let err = realm
            .authenticate(&details(json!({"authmethods": ["wampcra"]})))
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::NoMatchingMethod));
        assert_eq!(err.reason(), reason::NO_AUTH_METHOD);
        assert_eq!(err.to_string(), "could not authenticate with any method");

        // No authmethods at all on a guarded realm
        assert!(realm.authenticate(&Dict::new()).is_err());
    }

    #[test]
    fn test_challenge_response() {
        let realm = Realm::new("realm1")
            .with_authenticator("user", UserAuthenticator)
            .with_challenge_authenticator("ticket", TicketAuthenticator::new(["secret"]));

        // Peer order decides, not configuration order
        let outcome = realm
            .authenticate(&details(json!({"authmethods": ["unknown", "ticket", "user"]})))
            .unwrap();
        let AuthOutcome::Challenge { method, extra } = outcome else {
            panic!("Expected Challenge");
        };
        assert_eq!(method, "ticket");

        let welcome = realm.verify(&method, &extra, "secret").unwrap();
        assert_eq!(welcome["authmethod"], "ticket");

        let err = realm.verify(&method, &extra, "wrong").unwrap_err();
        assert_eq!(err.reason(), reason::AUTHENTICATION_FAILED);

        // Single-shot methods cannot be verified
        assert!(realm.verify("user", &extra, "secret").is_err());
    }

    #[tokio::test]
    async fn test_leave_cleans_up_routing() {
        let realm = Realm::new("realm1");
        let (handle, mut rx) = join(&realm.sessions, 7);

        realm
            .broker()
            .subscribe(&handle, Subscribe {
                request: 1,
                topic: "t".into(),
                ..Default::default()
            })
            .await;
        realm
            .dealer()
            .register(&handle, Register {
                request: 2,
                procedure: "p".into(),
                ..Default::default()
            })
            .await;
        let _ = next(&mut rx).await;
        let _ = next(&mut rx).await;
        assert_eq!(realm.session_count(), 1);

        assert!(realm.leave(7).await);
        assert!(!realm.leave(7).await);
        assert_eq!(realm.session_count(), 0);
        assert_eq!(realm.broker().subscription_count().await, 0);
        assert_eq!(realm.dealer().registration_count().await, 0);
    }

    #[test]
    fn test_authorizer() {
        let realm = Realm::new("realm1")
            .with_authorizer(|_: Id, message: &Message, _: &Dict| !matches!(message, Message::Publish(_)));
        assert!(!realm.authorize(1, &Message::publish(1, "t"), &Dict::new()));
        assert!(realm.authorize(1, &Message::subscribe(1, "t"), &Dict::new()));
    }
}
