//! Wire protocol types.
//!
//! The relay speaks STOMP 1.2 over WebSocket text messages.
//!
//! # Protocol Overview
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `CONNECT` | Client → Broker | Handshake, heart-beat offer |
//! | `CONNECTED` | Broker → Client | Handshake accepted |
//! | `SUBSCRIBE` / `UNSUBSCRIBE` | Client → Broker | Attach/detach a topic |
//! | `SEND` | Client → Broker | Publish |
//! | `MESSAGE` | Broker → Client | Push on a subscribed topic |
//! | `ERROR` | Broker → Client | Fatal error, connection closes |
//! | `DISCONNECT` / `RECEIPT` | Both | Graceful teardown |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame codec |
//! | `update` | Decoded payloads and entity kinds |

// ============================================================================
// Submodules
// ============================================================================

/// STOMP frame codec.
pub mod frame;

/// Decoded push payloads.
pub mod update;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{Command, Frame};
pub use update::{EntityKind, ParsedUpdate, Update, topics};
