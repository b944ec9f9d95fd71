//! Realtime Relay - shared, reconnecting topic fan-out over STOMP.
//!
//! This library keeps one persistent WebSocket connection to a STOMP
//! broker and fans server-pushed updates out to any number of in-process
//! consumers by topic.
//!
//! # Architecture
//!
//! The client follows a single-connection, many-consumers model:
//!
//! - **Transport**: one socket, one event loop task, heart-beats
//! - **Registry**: topic → callbacks, the source of truth for what is
//!   subscribed
//! - **Consumers**: register and unregister callbacks at any time, even
//!   from inside a callback
//!
//! Key design principles:
//!
//! - One transport subscription per distinct topic, however many callbacks
//! - Registrations survive unexpected drops and are replayed on reconnect
//! - Only [`RealtimeClient::disconnect`] clears registrations
//! - A panicking callback never affects its siblings
//!
//! # Quick Start
//!
//! ```no_run
//! use realtime_relay::{RealtimeClient, Result, topics};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = RealtimeClient::builder()
//!         .endpoint("ws://localhost:8080/ws")
//!         .token("session-token")
//!         .build()?;
//!
//!     // Subscribing before connect is fine
//!     let orders = client.subscribe(topics::ORDERS, |update| {
//!         println!("order update: {:?}", update.parse());
//!     });
//!
//!     client.connect().await?;
//!
//!     // ...
//!
//!     orders.unsubscribe();
//!     client.disconnect();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`RealtimeClient`], registry, reconnect, options |
//! | [`consumer`] | Lifecycle-bound [`Consumer`] |
//! | [`context`] | Application-wide [`SharedContext`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | STOMP frames and decoded updates |
//! | [`transport`] | WebSocket transport layer (internal) |

// ============================================================================
// Modules
// ============================================================================

/// Shared realtime client.
///
/// Use [`RealtimeClient::builder()`] to create a configured client.
pub mod client;

/// Lifecycle-bound consumers.
pub mod consumer;

/// Application-wide client context.
pub mod context;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for topics and subscriptions.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// STOMP protocol types.
///
/// Frame codec plus the decoded update model.
pub mod protocol;

/// WebSocket transport layer.
///
/// Internal module handling the broker connection and its event loop.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    Backoff, Callback, ClientBuilder, ClientOptions, ConnectionState, HeartbeatConfig,
    NegotiatedHeartbeat, RealtimeClient, ReconnectPolicy, Subscription,
};

// Consumer types
pub use consumer::{Consumer, ConsumerOptions};
pub use context::SharedContext;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, SubscriptionId, Topic, TransportSubscriptionId};

// Protocol types
pub use protocol::{EntityKind, ParsedUpdate, Update, topics};
