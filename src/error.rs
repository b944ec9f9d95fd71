//! Error types for the realtime relay.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use realtime_relay::{RealtimeClient, Result};
//!
//! async fn example(client: &RealtimeClient) -> Result<()> {
//!     client.connect().await?;
//!     client.publish("/app/ping", &serde_json::json!({ "ok": true }))?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::NotConnected`], [`Error::Disconnected`], [`Error::Connect`] |
//! | Protocol | [`Error::Handshake`], [`Error::Protocol`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    ///
    /// Returned when the socket cannot be opened or the upgrade is refused.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection timeout during dial or STOMP handshake.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// WebSocket connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation requires a live connection.
    #[error("Not connected")]
    NotConnected,

    /// Connect attempt aborted by an explicit `disconnect()`.
    #[error("Connect attempt aborted by disconnect")]
    Disconnected,

    /// Outcome of a shared connect attempt.
    ///
    /// Every caller that joined the same in-flight attempt receives the
    /// same underlying error.
    #[error("Connect failed: {0}")]
    Connect(Arc<Error>),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// The broker rejected the STOMP handshake.
    #[error("Handshake rejected: {message}")]
    Handshake {
        /// Message reported by the broker.
        message: String,
    },

    /// Malformed frame or protocol violation.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Endpoint URL could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ConnectionTimeout { .. } => true,
            Self::Connect(inner) => inner.is_timeout(),
            _ => false,
        }
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection { .. }
            | Self::ConnectionTimeout { .. }
            | Self::ConnectionClosed
            | Self::NotConnected
            | Self::Disconnected
            | Self::WebSocket(_) => true,
            Self::Connect(inner) => inner.is_connection_error(),
            _ => false,
        }
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection { .. }
            | Self::ConnectionTimeout { .. }
            | Self::ConnectionClosed
            | Self::NotConnected
            | Self::WebSocket(_) => true,
            Self::Connect(inner) => inner.is_recoverable(),
            _ => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
