//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`RealtimeClient`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use realtime_relay::RealtimeClient;
//!
//! # fn example() -> realtime_relay::Result<()> {
//! let client = RealtimeClient::builder()
//!     .endpoint("wss://tracker.example.com/ws")
//!     .token("session-token")
//!     .connect_timeout(Duration::from_secs(5))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

use super::core::RealtimeClient;
use super::options::{ClientOptions, DEFAULT_CONNECT_TIMEOUT, HeartbeatConfig};
use super::reconnect::ReconnectPolicy;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`RealtimeClient`].
///
/// Use [`RealtimeClient::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct ClientBuilder {
    /// Raw endpoint, parsed on build.
    endpoint: Option<String>,
    /// Session token.
    token: Option<String>,
    /// CONNECT `host` header override.
    host: Option<String>,
    /// Dial + handshake timeout.
    connect_timeout: Option<Duration>,
    /// Heart-beat offer.
    heartbeat: Option<HeartbeatConfig>,
    /// Reconnect policy.
    reconnect: Option<ReconnectPolicy>,
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a new builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the WebSocket endpoint.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - `ws://` or `wss://` URL (e.g., "ws://localhost:8080/ws")
    #[inline]
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the session token sent with the connect request.
    #[inline]
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Overrides the CONNECT `host` header.
    #[inline]
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the dial + handshake timeout.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the heart-beat offer.
    #[inline]
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Sets the reconnect policy.
    #[inline]
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Disables automatic reconnect.
    #[inline]
    #[must_use]
    pub fn no_reconnect(self) -> Self {
        self.reconnect(ReconnectPolicy::disabled())
    }

    /// Returns the options this builder would produce.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the endpoint is not set
    /// - [`Error::Url`] if the endpoint does not parse
    pub fn options(&self) -> Result<ClientOptions> {
        let endpoint = self.validate_endpoint()?;

        let mut options = ClientOptions::new(endpoint)
            .with_connect_timeout(self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .with_heartbeat(self.heartbeat.unwrap_or_default())
            .with_reconnect(self.reconnect.clone().unwrap_or_default());

        if let Some(token) = &self.token {
            options = options.with_token(token.clone());
        }
        if let Some(host) = &self.host {
            options = options.with_host(host.clone());
        }

        Ok(options)
    }

    /// Builds the client with validation.
    ///
    /// Does not connect.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the endpoint is missing or the options are
    ///   invalid
    /// - [`Error::Url`] if the endpoint does not parse
    pub fn build(self) -> Result<RealtimeClient> {
        RealtimeClient::new(self.options()?)
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    /// Parses the endpoint configuration.
    fn validate_endpoint(&self) -> Result<Url> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            Error::config(
                "Endpoint is required. Use .endpoint() to set it.\n\
                 Example: RealtimeClient::builder().endpoint(\"ws://localhost:8080/ws\")",
            )
        })?;

        Ok(Url::parse(endpoint)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
