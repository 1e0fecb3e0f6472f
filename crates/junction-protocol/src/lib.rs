//! # junction-protocol
//!
//! Message set and wire codec for the Junction WAMP router.
//!
//! This crate defines the typed messages exchanged between peers and the
//! router, the identifier and URI types they carry, and the array-form codec
//! used on the wire (JSON or MessagePack).
//!
//! ## Message Groups
//!
//! - `Hello` / `Welcome` / `Abort` / `Challenge` / `Authenticate` / `Goodbye` - Session lifecycle
//! - `Publish` / `Subscribe` / `Unsubscribe` / `Event` - Publish/subscribe
//! - `Register` / `Unregister` / `Call` / `Invocation` / `Yield` / `Result` - Remote procedure calls
//! - `Error` - Failed requests
//!
//! ## Example
//!
//! ```rust
//! use junction_protocol::{codec, Message, Serialization};
//!
//! let message = Message::subscribe(1, "com.example.topic");
//!
//! let encoded = codec::encode(&message, Serialization::Json).unwrap();
//! let decoded = codec::decode(&encoded, Serialization::Json).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod messages;
pub mod types;

pub use codec::{decode, encode, ProtocolError, Serialization};
pub use messages::{Message, MessageType};
pub use types::{reason, Dict, Id, List, Uri};
