//! WebSocket transport layer.
//!
//! This module owns the single physical connection to the broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                          ┌──────────────────┐
//! │  RealtimeClient  │        WebSocket         │  STOMP broker    │
//! │                  │◄────────────────────────►│                  │
//! │  → Connection    │   CONNECT / SUBSCRIBE    │  /topic/*        │
//! │    (event loop)  │   MESSAGE / heart-beat   │                  │
//! └──────────────────┘                          └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `connector::connect` - Dial, CONNECT, wait for CONNECTED
//! 2. `Connection` - Send frames, route MESSAGE frames, heart-beats
//! 3. `Connection::shutdown` - DISCONNECT and close
//!
//! Anything above this module only sees frames; how the socket is opened
//! stays behind this boundary.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Established session and event loop |
//! | `connector` | Dial and STOMP handshake |

// ============================================================================
// Submodules
// ============================================================================

/// Established session and event loop.
pub mod connection;

/// Dial and STOMP handshake.
pub mod connector;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{CloseHandler, CloseReason, Connection, FrameHandler, WsStream};
pub use connector::connect;
