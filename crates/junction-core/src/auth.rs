//! Authentication and authorization hooks.
//!
//! A realm holds any number of named authenticators. Single-shot
//! authenticators decide from the HELLO details alone; challenge/response
//! authenticators issue a CHALLENGE and check the AUTHENTICATE signature.

use junction_protocol::{Dict, Id, Message};
use std::collections::HashSet;
use thiserror::Error;

/// Errors returned by an authenticator.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credentials were rejected.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The HELLO details lacked something the method needs.
    #[error("Missing detail: {0}")]
    MissingDetail(&'static str),
}

/// Authenticates a peer from its HELLO details alone.
pub trait Authenticator: Send + Sync {
    /// Return the WELCOME details on success.
    fn authenticate(&self, details: &Dict) -> Result<Dict, AuthError>;
}

/// Authenticates a peer with a CHALLENGE/AUTHENTICATE exchange.
pub trait ChallengeAuthenticator: Send + Sync {
    /// Produce the challenge data sent in the CHALLENGE message.
    fn challenge(&self, details: &Dict) -> Result<Dict, AuthError>;

    /// Check a signature against the challenge previously produced.
    ///
    /// Returns the WELCOME details on success.
    fn verify(&self, challenge: &Dict, signature: &str) -> Result<Dict, AuthError>;
}

/// Decides whether a session may perform a request.
pub trait Authorizer: Send + Sync {
    /// Return `true` to let the request through.
    fn authorize(&self, session: Id, message: &Message, details: &Dict) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(Id, &Message, &Dict) -> bool + Send + Sync,
{
    fn authorize(&self, session: Id, message: &Message, details: &Dict) -> bool {
        self(session, message, details)
    }
}

/// Authorizer that lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _session: Id, _message: &Message, _details: &Dict) -> bool {
        true
    }
}

/// Challenge/response authenticator backed by a static set of tickets.
///
/// The challenge is empty and the signature must be one of the tickets.
/// Tickets travel in the clear, so this is only fit for bootstrapping.
#[derive(Debug, Clone, Default)]
pub struct TicketAuthenticator {
    tickets: HashSet<String>,
}

impl TicketAuthenticator {
    /// Create an authenticator accepting the given tickets.
    pub fn new<I, S>(tickets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tickets: tickets.into_iter().map(Into::into).collect(),
        }
    }
}

impl ChallengeAuthenticator for TicketAuthenticator {
    fn challenge(&self, _details: &Dict) -> Result<Dict, AuthError> {
        Ok(Dict::new())
    }

    fn verify(&self, _challenge: &Dict, signature: &str) -> Result<Dict, AuthError> {
        if self.tickets.contains(signature) {
            Ok(Dict::new())
        } else {
            Err(AuthError::Rejected("invalid ticket".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_authenticator() {
        let auth = TicketAuthenticator::new(["open-sesame"]);
        let challenge = auth.challenge(&Dict::new()).unwrap();
        assert!(challenge.is_empty());

        assert!(auth.verify(&challenge, "open-sesame").is_ok());
        assert!(matches!(
            auth.verify(&challenge, "guess"),
            Err(AuthError::Rejected(_))
        ));
    }

    #[test]
    fn test_closure_authorizer() {
        let deny_calls = |_: Id, message: &Message, _: &Dict| !matches!(message, Message::Call(_));

        assert!(deny_calls.authorize(1, &Message::subscribe(1, "t"), &Dict::new()));
        assert!(!deny_calls.authorize(1, &Message::call(2, "p"), &Dict::new()));
        assert!(AllowAll.authorize(1, &Message::call(2, "p"), &Dict::new()));
    }
}
