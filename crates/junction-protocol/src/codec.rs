//! Codec for encoding and decoding Junction messages.
//!
//! Messages travel as arrays: `[TYPE, field, field, ...]`. The array is
//! built as a `serde_json::Value` and then written as JSON text or as
//! MessagePack, depending on the negotiated [`Serialization`].

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::messages::{
    Abort, Authenticate, Call, CallResult, Challenge, Error as ErrorMessage, Event, Goodbye, Hello,
    Invocation, Message, MessageType, Publish, Published, Register, Registered, Subscribe,
    Subscribed, Unregister, Unregistered, Unsubscribe, Unsubscribed, Welcome, Yield,
};
use crate::types::{Dict, Id, List, Uri};

/// Maximum encoded message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(usize),

    /// The leading type code is not part of the message set.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    /// The array does not match the layout of its message type.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Payload serialization negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serialization {
    /// JSON text.
    #[default]
    Json,
    /// MessagePack binary.
    MsgPack,
}

impl Serialization {
    /// WebSocket subprotocol name.
    #[must_use]
    pub fn subprotocol(self) -> &'static str {
        match self {
            Serialization::Json => "wamp.2.json",
            Serialization::MsgPack => "wamp.2.msgpack",
        }
    }

    /// Look up a serialization by WebSocket subprotocol name.
    #[must_use]
    pub fn from_subprotocol(name: &str) -> Option<Self> {
        match name.trim() {
            "wamp.2.json" => Some(Serialization::Json),
            "wamp.2.msgpack" => Some(Serialization::MsgPack),
            _ => None,
        }
    }

    /// Serializer code used in the raw-socket handshake.
    #[must_use]
    pub fn raw_socket_code(self) -> u8 {
        match self {
            Serialization::Json => 1,
            Serialization::MsgPack => 2,
        }
    }

    /// Look up a serialization by raw-socket serializer code.
    #[must_use]
    pub fn from_raw_socket_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Serialization::Json),
            2 => Some(Serialization::MsgPack),
            _ => None,
        }
    }
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &Message, serialization: Serialization) -> Result<Bytes, ProtocolError> {
    let value = to_value(message);
    let payload = match serialization {
        Serialization::Json => serde_json::to_vec(&value)?,
        Serialization::MsgPack => rmp_serde::to_vec(&value)?,
    };

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode a message from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, cannot be parsed, or does not
/// describe a known message.
pub fn decode(data: &[u8], serialization: Serialization) -> Result<Message, ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(data.len()));
    }

    let value: Value = match serialization {
        Serialization::Json => serde_json::from_slice(data)?,
        Serialization::MsgPack => rmp_serde::from_slice(data)?,
    };
    from_value(value)
}

/// Build the array form of a message.
#[must_use]
pub fn to_value(message: &Message) -> Value {
    let mut out = vec![Value::from(u8::from(message.message_type()))];

    match message {
        Message::Hello(m) => {
            out.push(uri(&m.realm));
            out.push(Value::Object(m.details.clone()));
        }
        Message::Welcome(m) => {
            out.push(Value::from(m.session));
            out.push(Value::Object(m.details.clone()));
        }
        Message::Abort(m) => {
            out.push(Value::Object(m.details.clone()));
            out.push(uri(&m.reason));
        }
        Message::Challenge(m) => {
            out.push(Value::from(m.auth_method.clone()));
            out.push(Value::Object(m.extra.clone()));
        }
        Message::Authenticate(m) => {
            out.push(Value::from(m.signature.clone()));
            out.push(Value::Object(m.extra.clone()));
        }
        Message::Goodbye(m) => {
            out.push(Value::Object(m.details.clone()));
            out.push(uri(&m.reason));
        }
        Message::Error(m) => {
            out.push(Value::from(u8::from(m.request_type)));
            out.push(Value::from(m.request));
            out.push(Value::Object(m.details.clone()));
            out.push(uri(&m.error));
            push_payload(&mut out, &m.arguments, &m.arguments_kw);
        }
        Message::Publish(m) => {
            out.push(Value::from(m.request));
            out.push(Value::Object(m.options.clone()));
            out.push(uri(&m.topic));
            push_payload(&mut out, &m.arguments, &m.arguments_kw);
        }
        Message::Published(m) => {
            out.push(Value::from(m.request));
            out.push(Value::from(m.publication));
        }
        Message::Subscribe(m) => {
            out.push(Value::from(m.request));
            out.push(Value::Object(m.options.clone()));
            out.push(uri(&m.topic));
        }
        Message::Subscribed(m) => {
            out.push(Value::from(m.request));
            out.push(Value::from(m.subscription));
        }
        Message::Unsubscribe(m) => {
            out.push(Value::from(m.request));
            out.push(Value::from(m.subscription));
        }
        Message::Unsubscribed(m) => {
            out.push(Value::from(m.request));
        }
        Message::Event(m) => {
            out.push(Value::from(m.subscription));
            out.push(Value::from(m.publication));
            out.push(Value::Object(m.details.clone()));
            push_payload(&mut out, &m.arguments, &m.arguments_kw);
        }
        Message::Call(m) => {
            out.push(Value::from(m.request));
            out.push(Value::Object(m.options.clone()));
            out.push(uri(&m.procedure));
            push_payload(&mut out, &m.arguments, &m.arguments_kw);
        }
        Message::Result(m) => {
            out.push(Value::from(m.request));
            out.push(Value::Object(m.details.clone()));
            push_payload(&mut out, &m.arguments, &m.arguments_kw);
        }
        Message::Register(m) => {
            out.push(Value::from(m.request));
            out.push(Value::Object(m.options.clone()));
            out.push(uri(&m.procedure));
        }
        Message::Registered(m) => {
            out.push(Value::from(m.request));
            out.push(Value::from(m.registration));
        }
        Message::Unregister(m) => {
            out.push(Value::from(m.request));
            out.push(Value::from(m.registration));
        }
        Message::Unregistered(m) => {
            out.push(Value::from(m.request));
        }
        Message::Invocation(m) => {
            out.push(Value::from(m.request));
            out.push(Value::from(m.registration));
            out.push(Value::Object(m.details.clone()));
            push_payload(&mut out, &m.arguments, &m.arguments_kw);
        }
        Message::Yield(m) => {
            out.push(Value::from(m.request));
            out.push(Value::Object(m.options.clone()));
            push_payload(&mut out, &m.arguments, &m.arguments_kw);
        }
    }

    Value::Array(out)
}

/// Parse the array form of a message.
///
/// # Errors
///
/// Returns an error if the value is not an array of the expected layout.
pub fn from_value(value: Value) -> Result<Message, ProtocolError> {
    let Value::Array(items) = value else {
        return Err(ProtocolError::Malformed("message is not an array".into()));
    };
    let mut fields = Fields(items.into_iter());
    let message_type = fields.message_type()?;

    let message = match message_type {
        MessageType::Hello => Message::Hello(Hello {
            realm: fields.uri("realm")?,
            details: fields.dict("details")?,
        }),
        MessageType::Welcome => Message::Welcome(Welcome {
            session: fields.id("session")?,
            details: fields.dict("details")?,
        }),
        MessageType::Abort => Message::Abort(Abort {
            details: fields.dict("details")?,
            reason: fields.uri("reason")?,
        }),
        MessageType::Challenge => Message::Challenge(Challenge {
            auth_method: fields.string("auth_method")?,
            extra: fields.dict("extra")?,
        }),
        MessageType::Authenticate => Message::Authenticate(Authenticate {
            signature: fields.string("signature")?,
            extra: fields.dict("extra")?,
        }),
        MessageType::Goodbye => Message::Goodbye(Goodbye {
            details: fields.dict("details")?,
            reason: fields.uri("reason")?,
        }),
        MessageType::Error => Message::Error(ErrorMessage {
            request_type: fields.message_type()?,
            request: fields.id("request")?,
            details: fields.dict("details")?,
            error: fields.uri("error")?,
            arguments: fields.optional_list("arguments")?,
            arguments_kw: fields.optional_dict("arguments_kw")?,
        }),
        MessageType::Publish => Message::Publish(Publish {
            request: fields.id("request")?,
            options: fields.dict("options")?,
            topic: fields.uri("topic")?,
            arguments: fields.optional_list("arguments")?,
            arguments_kw: fields.optional_dict("arguments_kw")?,
        }),
        MessageType::Published => Message::Published(Published {
            request: fields.id("request")?,
            publication: fields.id("publication")?,
        }),
        MessageType::Subscribe => Message::Subscribe(Subscribe {
            request: fields.id("request")?,
            options: fields.dict("options")?,
            topic: fields.uri("topic")?,
        }),
        MessageType::Subscribed => Message::Subscribed(Subscribed {
            request: fields.id("request")?,
            subscription: fields.id("subscription")?,
        }),
        MessageType::Unsubscribe => Message::Unsubscribe(Unsubscribe {
            request: fields.id("request")?,
            subscription: fields.id("subscription")?,
        }),
        MessageType::Unsubscribed => Message::Unsubscribed(Unsubscribed {
            request: fields.id("request")?,
        }),
        MessageType::Event => Message::Event(Event {
            subscription: fields.id("subscription")?,
            publication: fields.id("publication")?,
            details: fields.dict("details")?,
            arguments: fields.optional_list("arguments")?,
            arguments_kw: fields.optional_dict("arguments_kw")?,
        }),
        MessageType::Call => Message::Call(Call {
            request: fields.id("request")?,
            options: fields.dict("options")?,
            procedure: fields.uri("procedure")?,
            arguments: fields.optional_list("arguments")?,
            arguments_kw: fields.optional_dict("arguments_kw")?,
        }),
        MessageType::Result => Message::Result(CallResult {
            request: fields.id("request")?,
            details: fields.dict("details")?,
            arguments: fields.optional_list("arguments")?,
            arguments_kw: fields.optional_dict("arguments_kw")?,
        }),
        MessageType::Register => Message::Register(Register {
            request: fields.id("request")?,
            options: fields.dict("options")?,
            procedure: fields.uri("procedure")?,
        }),
        MessageType::Registered => Message::Registered(Registered {
            request: fields.id("request")?,
            registration: fields.id("registration")?,
        }),
        MessageType::Unregister => Message::Unregister(Unregister {
            request: fields.id("request")?,
            registration: fields.id("registration")?,
        }),
        MessageType::Unregistered => Message::Unregistered(Unregistered {
            request: fields.id("request")?,
        }),
        MessageType::Invocation => Message::Invocation(Invocation {
            request: fields.id("request")?,
            registration: fields.id("registration")?,
            details: fields.dict("details")?,
            arguments: fields.optional_list("arguments")?,
            arguments_kw: fields.optional_dict("arguments_kw")?,
        }),
        MessageType::Yield => Message::Yield(Yield {
            request: fields.id("request")?,
            options: fields.dict("options")?,
            arguments: fields.optional_list("arguments")?,
            arguments_kw: fields.optional_dict("arguments_kw")?,
        }),
    };

    Ok(message)
}

fn uri(uri: &Uri) -> Value {
    Value::from(uri.as_str())
}

// Trailing payload fields are omitted when empty; `arguments` is kept as an
// empty list when only `arguments_kw` is present.
fn push_payload(out: &mut Vec<Value>, arguments: &List, arguments_kw: &Dict) {
    if !arguments_kw.is_empty() {
        out.push(Value::Array(arguments.clone()));
        out.push(Value::Object(arguments_kw.clone()));
    } else if !arguments.is_empty() {
        out.push(Value::Array(arguments.clone()));
    }
}

/// Sequential reader over the elements of a message array.
struct Fields(std::vec::IntoIter<Value>);

impl Fields {
    fn next(&mut self, name: &str) -> Result<Value, ProtocolError> {
        self.0
            .next()
            .ok_or_else(|| ProtocolError::Malformed(format!("missing field `{name}`")))
    }

    fn message_type(&mut self) -> Result<MessageType, ProtocolError> {
        let code = self.id("message type")?;
        u8::try_from(code)
            .ok()
            .and_then(|c| MessageType::try_from(c).ok())
            .ok_or(ProtocolError::UnknownMessageType(code))
    }

    fn id(&mut self, name: &str) -> Result<Id, ProtocolError> {
        self.next(name)?.as_u64().ok_or_else(|| {
            ProtocolError::Malformed(format!("field `{name}` is not a non-negative integer"))
        })
    }

    fn string(&mut self, name: &str) -> Result<String, ProtocolError> {
        match self.next(name)? {
            Value::String(s) => Ok(s),
            _ => Err(ProtocolError::Malformed(format!(
                "field `{name}` is not a string"
            ))),
        }
    }

    fn uri(&mut self, name: &str) -> Result<Uri, ProtocolError> {
        self.string(name).map(Uri::from)
    }

    fn dict(&mut self, name: &str) -> Result<Dict, ProtocolError> {
        match self.next(name)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Dict::new()),
            _ => Err(ProtocolError::Malformed(format!(
                "field `{name}` is not a dictionary"
            ))),
        }
    }

    fn optional_list(&mut self, name: &str) -> Result<List, ProtocolError> {
        match self.0.next() {
            None | Some(Value::Null) => Ok(List::new()),
            Some(Value::Array(list)) => Ok(list),
            Some(_) => Err(ProtocolError::Malformed(format!(
                "field `{name}` is not a list"
            ))),
        }
    }

    fn optional_dict(&mut self, name: &str) -> Result<Dict, ProtocolError> {
        match self.0.next() {
            None | Some(Value::Null) => Ok(Dict::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(ProtocolError::Malformed(format!(
                "field `{name}` is not a dictionary"
            ))),
        }
    }
}
