//! Message types for the Junction protocol.
//!
//! Every message the router consumes or produces is a variant of [`Message`].
//! The wire layout of each struct follows its field order; see
//! [`codec`](crate::codec) for the array form.

use crate::types::{reason, Dict, Id, List, Uri};
use std::fmt;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Challenge = 4,
    Authenticate = 5,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
    Call = 48,
    Result = 50,
    Register = 64,
    Registered = 65,
    Unregister = 66,
    Unregistered = 67,
    Invocation = 68,
    Yield = 70,
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::Welcome),
            3 => Ok(MessageType::Abort),
            4 => Ok(MessageType::Challenge),
            5 => Ok(MessageType::Authenticate),
            6 => Ok(MessageType::Goodbye),
            8 => Ok(MessageType::Error),
            16 => Ok(MessageType::Publish),
            17 => Ok(MessageType::Published),
            32 => Ok(MessageType::Subscribe),
            33 => Ok(MessageType::Subscribed),
            34 => Ok(MessageType::Unsubscribe),
            35 => Ok(MessageType::Unsubscribed),
            36 => Ok(MessageType::Event),
            48 => Ok(MessageType::Call),
            50 => Ok(MessageType::Result),
            64 => Ok(MessageType::Register),
            65 => Ok(MessageType::Registered),
            66 => Ok(MessageType::Unregister),
            67 => Ok(MessageType::Unregistered),
            68 => Ok(MessageType::Invocation),
            70 => Ok(MessageType::Yield),
            _ => Err("Invalid message type"),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Abort => "ABORT",
            MessageType::Challenge => "CHALLENGE",
            MessageType::Authenticate => "AUTHENTICATE",
            MessageType::Goodbye => "GOODBYE",
            MessageType::Error => "ERROR",
            MessageType::Publish => "PUBLISH",
            MessageType::Published => "PUBLISHED",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::Subscribed => "SUBSCRIBED",
            MessageType::Unsubscribe => "UNSUBSCRIBE",
            MessageType::Unsubscribed => "UNSUBSCRIBED",
            MessageType::Event => "EVENT",
            MessageType::Call => "CALL",
            MessageType::Result => "RESULT",
            MessageType::Register => "REGISTER",
            MessageType::Registered => "REGISTERED",
            MessageType::Unregister => "UNREGISTER",
            MessageType::Unregistered => "UNREGISTERED",
            MessageType::Invocation => "INVOCATION",
            MessageType::Yield => "YIELD",
        };
        f.write_str(name)
    }
}

/// `[HELLO, Realm|uri, Details|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Hello {
    pub realm: Uri,
    pub details: Dict,
}

/// `[WELCOME, Session|id, Details|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Welcome {
    pub session: Id,
    pub details: Dict,
}

/// `[ABORT, Details|dict, Reason|uri]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Abort {
    pub details: Dict,
    pub reason: Uri,
}

/// `[CHALLENGE, AuthMethod|string, Extra|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Challenge {
    pub auth_method: String,
    pub extra: Dict,
}

/// `[AUTHENTICATE, Signature|string, Extra|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Authenticate {
    pub signature: String,
    pub extra: Dict,
}

/// `[GOODBYE, Details|dict, Reason|uri]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Goodbye {
    pub details: Dict,
    pub reason: Uri,
}

/// `[ERROR, REQUEST.Type|int, REQUEST.Request|id, Details|dict, Error|uri, Arguments|list, ArgumentsKw|dict]`
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// Type of the request that failed.
    pub request_type: MessageType,
    /// Id of the request that failed.
    pub request: Id,
    pub details: Dict,
    pub error: Uri,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// `[PUBLISH, Request|id, Options|dict, Topic|uri, Arguments|list, ArgumentsKw|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Publish {
    pub request: Id,
    pub options: Dict,
    pub topic: Uri,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// `[PUBLISHED, PUBLISH.Request|id, Publication|id]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Published {
    pub request: Id,
    pub publication: Id,
}

/// `[SUBSCRIBE, Request|id, Options|dict, Topic|uri]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Subscribe {
    pub request: Id,
    pub options: Dict,
    pub topic: Uri,
}

/// `[SUBSCRIBED, SUBSCRIBE.Request|id, Subscription|id]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Subscribed {
    pub request: Id,
    pub subscription: Id,
}

/// `[UNSUBSCRIBE, Request|id, SUBSCRIBED.Subscription|id]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Unsubscribe {
    pub request: Id,
    pub subscription: Id,
}

/// `[UNSUBSCRIBED, UNSUBSCRIBE.Request|id]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Unsubscribed {
    pub request: Id,
}

/// `[EVENT, SUBSCRIBED.Subscription|id, PUBLISHED.Publication|id, Details|dict, Arguments|list, ArgumentsKw|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    pub subscription: Id,
    pub publication: Id,
    pub details: Dict,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// `[CALL, Request|id, Options|dict, Procedure|uri, Arguments|list, ArgumentsKw|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Call {
    pub request: Id,
    pub options: Dict,
    pub procedure: Uri,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// `[RESULT, CALL.Request|id, Details|dict, YIELD.Arguments|list, YIELD.ArgumentsKw|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallResult {
    pub request: Id,
    pub details: Dict,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// `[REGISTER, Request|id, Options|dict, Procedure|uri]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Register {
    pub request: Id,
    pub options: Dict,
    pub procedure: Uri,
}

/// `[REGISTERED, REGISTER.Request|id, Registration|id]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Registered {
    pub request: Id,
    pub registration: Id,
}

/// `[UNREGISTER, Request|id, REGISTERED.Registration|id]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Unregister {
    pub request: Id,
    pub registration: Id,
}

/// `[UNREGISTERED, UNREGISTER.Request|id]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Unregistered {
    pub request: Id,
}

/// `[INVOCATION, Request|id, REGISTERED.Registration|id, Details|dict, CALL.Arguments|list, CALL.ArgumentsKw|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Invocation {
    pub request: Id,
    pub registration: Id,
    pub details: Dict,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// `[YIELD, INVOCATION.Request|id, Options|dict, Arguments|list, ArgumentsKw|dict]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Yield {
    pub request: Id,
    pub options: Dict,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Abort(Abort),
    Challenge(Challenge),
    Authenticate(Authenticate),
    Goodbye(Goodbye),
    Error(Error),
    Publish(Publish),
    Published(Published),
    Subscribe(Subscribe),
    Subscribed(Subscribed),
    Unsubscribe(Unsubscribe),
    Unsubscribed(Unsubscribed),
    Event(Event),
    Call(Call),
    Result(CallResult),
    Register(Register),
    Registered(Registered),
    Unregister(Unregister),
    Unregistered(Unregistered),
    Invocation(Invocation),
    Yield(Yield),
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Welcome(_) => MessageType::Welcome,
            Message::Abort(_) => MessageType::Abort,
            Message::Challenge(_) => MessageType::Challenge,
            Message::Authenticate(_) => MessageType::Authenticate,
            Message::Goodbye(_) => MessageType::Goodbye,
            Message::Error(_) => MessageType::Error,
            Message::Publish(_) => MessageType::Publish,
            Message::Published(_) => MessageType::Published,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::Subscribed(_) => MessageType::Subscribed,
            Message::Unsubscribe(_) => MessageType::Unsubscribe,
            Message::Unsubscribed(_) => MessageType::Unsubscribed,
            Message::Event(_) => MessageType::Event,
            Message::Call(_) => MessageType::Call,
            Message::Result(_) => MessageType::Result,
            Message::Register(_) => MessageType::Register,
            Message::Registered(_) => MessageType::Registered,
            Message::Unregister(_) => MessageType::Unregister,
            Message::Unregistered(_) => MessageType::Unregistered,
            Message::Invocation(_) => MessageType::Invocation,
            Message::Yield(_) => MessageType::Yield,
        }
    }

    /// Get the request id a client request carries, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<Id> {
        match self {
            Message::Publish(m) => Some(m.request),
            Message::Subscribe(m) => Some(m.request),
            Message::Unsubscribe(m) => Some(m.request),
            Message::Call(m) => Some(m.request),
            Message::Register(m) => Some(m.request),
            Message::Unregister(m) => Some(m.request),
            Message::Yield(m) => Some(m.request),
            Message::Error(m) => Some(m.request),
            _ => None,
        }
    }

    /// Create a HELLO message.
    #[must_use]
    pub fn hello(realm: impl Into<Uri>, details: Dict) -> Self {
        Message::Hello(Hello {
            realm: realm.into(),
            details,
        })
    }

    /// Create an ABORT message with the given reason.
    #[must_use]
    pub fn abort(reason: impl Into<Uri>) -> Self {
        Message::Abort(Abort {
            details: Dict::new(),
            reason: reason.into(),
        })
    }

    /// Create an ABORT message carrying a human-readable explanation.
    #[must_use]
    pub fn abort_with_message(reason: impl Into<Uri>, message: impl Into<String>) -> Self {
        let mut details = Dict::new();
        details.insert("message".to_string(), message.into().into());
        Message::Abort(Abort {
            details,
            reason: reason.into(),
        })
    }

    /// Create a GOODBYE message with the given reason.
    #[must_use]
    pub fn goodbye(reason: impl Into<Uri>) -> Self {
        Message::Goodbye(Goodbye {
            details: Dict::new(),
            reason: reason.into(),
        })
    }

    /// Create the GOODBYE that acknowledges a peer's GOODBYE.
    #[must_use]
    pub fn goodbye_and_out() -> Self {
        Self::goodbye(reason::GOODBYE_AND_OUT)
    }

    /// Create an ERROR reply for a failed request.
    #[must_use]
    pub fn error(request_type: MessageType, request: Id, error: impl Into<Uri>) -> Self {
        Message::Error(Error {
            request_type,
            request,
            details: Dict::new(),
            error: error.into(),
            arguments: List::new(),
            arguments_kw: Dict::new(),
        })
    }

    /// Create a SUBSCRIBE message.
    #[must_use]
    pub fn subscribe(request: Id, topic: impl Into<Uri>) -> Self {
        Message::Subscribe(Subscribe {
            request,
            options: Dict::new(),
            topic: topic.into(),
        })
    }

    /// Create an UNSUBSCRIBE message.
    #[must_use]
    pub fn unsubscribe(request: Id, subscription: Id) -> Self {
        Message::Unsubscribe(Unsubscribe {
            request,
            subscription,
        })
    }

    /// Create a PUBLISH message without options or payload.
    #[must_use]
    pub fn publish(request: Id, topic: impl Into<Uri>) -> Self {
        Message::Publish(Publish {
            request,
            topic: topic.into(),
            ..Default::default()
        })
    }

    /// Create a REGISTER message.
    #[must_use]
    pub fn register(request: Id, procedure: impl Into<Uri>) -> Self {
        Message::Register(Register {
            request,
            options: Dict::new(),
            procedure: procedure.into(),
        })
    }

    /// Create an UNREGISTER message.
    #[must_use]
    pub fn unregister(request: Id, registration: Id) -> Self {
        Message::Unregister(Unregister {
            request,
            registration,
        })
    }

    /// Create a CALL message without options or payload.
    #[must_use]
    pub fn call(request: Id, procedure: impl Into<Uri>) -> Self {
        Message::Call(Call {
            request,
            procedure: procedure.into(),
            ..Default::default()
        })
    }

    /// Create a YIELD message carrying positional arguments.
    #[must_use]
    pub fn yield_result(request: Id, arguments: List) -> Self {
        Message::Yield(Yield {
            request,
            arguments,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type() {
        let subscribe = Message::subscribe(1, "test");
        assert_eq!(subscribe.message_type(), MessageType::Subscribe);

        let call = Message::call(7, "com.example.add");
        assert_eq!(call.message_type(), MessageType::Call);
        assert_eq!(call.request_id(), Some(7));
        assert_eq!(Message::goodbye_and_out().request_id(), None);
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(1), Ok(MessageType::Hello));
        assert_eq!(MessageType::try_from(70), Ok(MessageType::Yield));
        assert_eq!(u8::from(MessageType::Invocation), 68);
        assert!(MessageType::try_from(7).is_err());
        assert!(MessageType::try_from(49).is_err());
    }

    #[test]
    fn test_abort_with_message() {
        match Message::abort_with_message(reason::NO_AUTH_METHOD, "nope") {
            Message::Abort(abort) => {
                assert_eq!(abort.reason, reason::NO_AUTH_METHOD);
                assert_eq!(abort.details["message"], "nope");
            }
            other => panic!("Expected Abort, got {:?}", other),
        }
    }
}
