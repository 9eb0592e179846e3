//! Relay Messaging: a peer-to-peer message bus over WebSockets.
//!
//! Every process runs a [`MessagingHub`] with an identity. Hubs accept
//! inbound connections, keep outbound connections to known servers alive,
//! and route addressed JSON messages to the peer whose identity matches.
//!
//! # Architecture
//!
//! - **Transport**: one `tokio-tungstenite` socket per link, owned by a
//!   background task.
//! - **Connection**: an actor driving a `relay_fsm` state machine (inbound
//!   or outbound table) for handshake, heartbeat and reconnect.
//! - **Hub**: connection set, listener with bind retry, identity routing
//!   with hierarchical short names (`"server"` reaches `"server.7"`).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use relay_messaging::{MessagingConfig, MessagingHub};
//!
//! # async fn example() -> Result<(), relay_messaging::MessagingError> {
//! let server = MessagingHub::new(MessagingConfig::server(
//!     "server.1",
//!     "127.0.0.1:8111".parse().unwrap(),
//! ));
//! server.start().await?;
//!
//! let client = MessagingHub::new(MessagingConfig::client("client"));
//! client.on_message(|msg| println!("got {:?}", msg.to_value()));
//! client.add_client("ws://127.0.0.1:8111/")?;
//!
//! client.wait_till_connected("server").await;
//! client.send_message("server", serde_json::json!("hello")).await?;
//!
//! client.remove_client("ws://127.0.0.1:8111/").await;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod hub;
pub mod identity;
pub mod logging;
pub mod message;
pub mod tables;
mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::MessagingConfig;
pub use connection::{Connection, ReadyState, Role};
pub use error::MessagingError;
pub use events::LifecycleEvent;
pub use hub::MessagingHub;
pub use message::{Envelope, InboundMessage};
