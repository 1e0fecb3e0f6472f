//! # junction-core
//!
//! Session protocol engine for the Junction router.
//!
//! This crate provides the routing building blocks:
//!
//! - **Router** - Realm registry, handshake and per-session dispatch
//! - **Realm** - Namespace with its own broker, dealer and authentication
//! - **Broker** - Topic subscriptions and event fan-out
//! - **Dealer** - Procedure registrations and call routing
//! - **Peer** - Message stream abstraction implemented by transports
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │    Peer     │────▶│   Router    │────▶│    Realm    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                            │       │
//!                                            ▼       ▼
//!                                   ┌──────────┐ ┌──────────┐
//!                                   │  Broker  │ │  Dealer  │
//!                                   └──────────┘ └──────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use junction_core::{pipe, Peer, Realm, Router};
//! use junction_protocol::{Dict, Message};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let router = Arc::new(Router::new());
//! router.register_realm(Realm::new("com.example.realm"))?;
//!
//! let (mut client, server) = pipe(16);
//! client.send(Message::hello("com.example.realm", Dict::new())).await?;
//! let session = router.accept(Box::new(server)).await?;
//! println!("Joined as session {session}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod broker;
pub mod dealer;
pub mod id;
pub mod peer;
pub mod realm;
pub mod router;
pub mod session;

#[cfg(test)]
mod test_support;

pub use auth::{AllowAll, AuthError, Authenticator, Authorizer, ChallengeAuthenticator, TicketAuthenticator};
pub use broker::Broker;
pub use dealer::Dealer;
pub use id::{new_id, RequestIds};
pub use peer::{pipe, ChannelPeer, Peer, PeerError, PeerIo, PeerSender, DEFAULT_PEER_CAPACITY};
pub use realm::{AuthOutcome, AuthenticationError, Realm};
pub use router::{Router, RouterConfig, RouterError, RouterStats};
pub use session::{SessionHandle, SessionTable};
