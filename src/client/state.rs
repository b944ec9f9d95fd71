//! Connection state.

use std::fmt;

/// Lifecycle state of the shared connection.
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──ok──▶ Connected
///      ▲                        ▲                 │
///      │                        └──unexpected drop┘
///      └──────────── disconnect (from any state) ─┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport. Initial state and the result of `disconnect()`.
    #[default]
    Disconnected,
    /// Handshake in flight or reconnect pending.
    Connecting,
    /// Transport live; registry topics are attached.
    Connected,
}

impl ConnectionState {
    /// Returns `true` if the transport is live.
    #[inline]
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` while a handshake or reconnect is pending.
    #[inline]
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Connected => f.write_str("Connected"),
        }
    }
}
