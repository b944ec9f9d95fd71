//! Client connection options.
//!
//! Provides a type-safe interface for the endpoint, auth token, handshake
//! timeout, heart-beats and reconnect policy.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use realtime_relay::{ClientOptions, HeartbeatConfig};
//!
//! let options = ClientOptions::new("ws://localhost:8080/ws".parse()?)
//!     .with_token("secret")
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_heartbeat(HeartbeatConfig::new(Duration::from_secs(20), Duration::from_secs(20)));
//!
//! // ws://localhost:8080/ws?access_token=secret
//! let url = options.connect_url();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

use super::reconnect::ReconnectPolicy;

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for dial + STOMP handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default heart-beat interval in both directions.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Query parameter carrying the session token.
const TOKEN_QUERY_PARAM: &str = "access_token";

// ============================================================================
// HeartbeatConfig
// ============================================================================

/// Heart-beat intervals offered in CONNECT.
///
/// A zero duration disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often the client can send heart-beats.
    pub outgoing: Duration,
    /// How often the client wants to receive heart-beats.
    pub incoming: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT, DEFAULT_HEARTBEAT)
    }
}

impl HeartbeatConfig {
    /// Creates a heart-beat configuration.
    #[inline]
    #[must_use]
    pub const fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    /// Disables heart-beats in both directions.
    #[inline]
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Returns the `heart-beat` header pair in milliseconds.
    #[inline]
    #[must_use]
    pub fn as_millis_pair(&self) -> (u64, u64) {
        (
            self.outgoing.as_millis() as u64,
            self.incoming.as_millis() as u64,
        )
    }

    /// Negotiates against the broker's `heart-beat` header.
    ///
    /// A direction is active only if both sides offer a non-zero value; the
    /// interval is the larger of the two.
    #[must_use]
    pub fn negotiate(&self, server: Option<(u64, u64)>) -> NegotiatedHeartbeat {
        let (cx, cy) = self.as_millis_pair();
        let (sx, sy) = server.unwrap_or((0, 0));

        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };

        NegotiatedHeartbeat {
            outgoing: pick(cx, sy),
            incoming: pick(cy, sx),
        }
    }
}

/// Heart-beat intervals agreed for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiatedHeartbeat {
    /// Interval at which the client sends EOL pings.
    pub outgoing: Option<Duration>,
    /// Interval at which the broker promised to send something.
    pub incoming: Option<Duration>,
}

// ============================================================================
// ClientOptions
// ============================================================================

/// Options for a [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub endpoint: Url,

    /// Session token appended to the endpoint.
    pub token: Option<String>,

    /// Override for the CONNECT `host` header.
    pub host: Option<String>,

    /// Timeout for dial + handshake.
    pub connect_timeout: Duration,

    /// Heart-beat offer.
    pub heartbeat: HeartbeatConfig,

    /// Reconnect policy after unexpected drops.
    pub reconnect: ReconnectPolicy,
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientOptions {
    /// Creates options with defaults for the given endpoint.
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            token: None,
            host: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientOptions {
    /// Sets the session token.
    #[inline]
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Overrides the CONNECT `host` header.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the dial + handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the heart-beat offer.
    #[inline]
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the reconnect policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

// ============================================================================
// Conversion Methods
// ============================================================================

impl ClientOptions {
    /// Returns the URL to dial, with the token attached.
    #[must_use]
    pub fn connect_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair(TOKEN_QUERY_PARAM, token);
        }
        url
    }

    /// Returns the CONNECT `host` header value.
    #[must_use]
    pub fn host_header(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        match (self.endpoint.host_str(), self.endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => "/".to_string(),
        }
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        match self.endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::config(format!(
                    "Endpoint scheme must be ws or wss, got {other:?}"
                )));
            }
        }

        if self.endpoint.host_str().is_none() {
            return Err(Error::config("Endpoint has no host"));
        }

        if self.connect_timeout.is_zero() {
            return Err(Error::config("Connect timeout must be greater than zero"));
        }

        if let Some(token) = &self.token
            && token.is_empty()
        {
            return Err(Error::config("Token must not be empty"));
        }

        self.reconnect.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================
