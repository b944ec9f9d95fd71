//! Shared realtime client.
//!
//! This module provides the connection manager and everything it owns.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RealtimeClient`] | Connection manager, shared by clones |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientOptions`] | Endpoint, token, timeouts, heart-beats |
//! | [`ReconnectPolicy`] | Backoff after unexpected drops |
//! | [`ConnectionState`] | Observable lifecycle state |
//! | [`Subscription`] | Handle for one registered callback |
//!
//! # Example
//!
//! ```no_run
//! use realtime_relay::{RealtimeClient, Result, topics};
//!
//! # async fn example() -> Result<()> {
//! let client = RealtimeClient::builder()
//!     .endpoint("ws://localhost:8080/ws")
//!     .token("session-token")
//!     .build()?;
//!
//! client.connect().await?;
//!
//! let stages = client.subscribe(topics::STAGES, |update| {
//!     println!("stage update: {}", update.body);
//! });
//! # let _ = stages;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for client configuration.
pub mod builder;

/// Connection manager implementation.
pub mod core;

/// Endpoint, token, timeout and heart-beat options.
pub mod options;

/// Reconnect policy and task.
pub mod reconnect;

/// Topic → callbacks registry.
pub mod registry;

/// Connection state.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;
pub use core::{RealtimeClient, Subscription};
pub use options::{ClientOptions, HeartbeatConfig, NegotiatedHeartbeat};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use registry::Callback;
pub use state::ConnectionState;
