//! Identifier and URI types shared by every message.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// A non-negative identifier.
///
/// Session, subscription, registration and publication ids are drawn from
/// `[0, 2^53)`; request ids are per-session counters starting at 1.
pub type Id = u64;

/// Keyword dictionary carried by options, details and `arguments_kw`.
pub type Dict = serde_json::Map<String, serde_json::Value>;

/// Positional argument list.
pub type List = Vec<serde_json::Value>;

/// A dot-separated identifier naming a realm, topic, procedure or error.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Create a new URI.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// Get the URI as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Uri {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for Uri {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Uri {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Uri {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Well-known error and reason URIs.
pub mod reason {
    /// Peer is not authorized to access the given resource.
    pub const NOT_AUTHORIZED: &str = "wamp.error.not_authorized";
    /// Peer wanted to join a realm that does not exist.
    pub const NO_SUCH_REALM: &str = "wamp.error.no_such_realm";
    /// The router is shutting down; used as a GOODBYE or ABORT reason.
    pub const SYSTEM_SHUTDOWN: &str = "wamp.error.system_shutdown";
    /// The peer wants to leave the realm.
    pub const CLOSE_REALM: &str = "wamp.error.close_realm";
    /// Acknowledges the end of a session.
    pub const GOODBYE_AND_OUT: &str = "wamp.error.goodbye_and_out";
    /// The called procedure is not registered.
    pub const NO_SUCH_PROCEDURE: &str = "wamp.error.no_such_procedure";
    /// The subscription to remove is not active.
    pub const NO_SUCH_SUBSCRIPTION: &str = "wamp.error.no_such_subscription";
    /// The registration to remove is not active.
    pub const NO_SUCH_REGISTRATION: &str = "wamp.error.no_such_registration";
    /// Arguments were not acceptable to the procedure.
    pub const INVALID_ARGUMENT: &str = "wamp.error.invalid_argument";
    /// The topic is not acceptable to the broker.
    pub const INVALID_TOPIC: &str = "wamp.error.invalid_topic";
    /// A procedure with this URI is already registered.
    pub const PROCEDURE_ALREADY_EXISTS: &str = "wamp.error.procedure_already_exists";
    /// Credentials were rejected.
    pub const AUTHENTICATION_FAILED: &str = "wamp.error.authentication_failed";
    /// None of the proposed authentication methods is configured.
    pub const NO_AUTH_METHOD: &str = "wamp.error.no_auth_method";
    /// The peer did not answer within the handshake window.
    pub const TIMEOUT: &str = "wamp.error.timeout";
    /// The call was dropped before the callee answered.
    pub const CANCELED: &str = "wamp.error.canceled";
    /// The router hit an inconsistent internal state.
    pub const INTERNAL_ERROR: &str = "wamp.error.internal_error";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_uri_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Uri::from("com.example.topic"), 1);
        assert_eq!(map.get("com.example.topic"), Some(&1));
        assert_eq!(Uri::from("a.b").to_string(), "a.b");
    }
}
