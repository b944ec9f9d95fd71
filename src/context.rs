//! Application-wide client context.
//!
//! Bootstrap code creates exactly one [`SharedContext`] and passes it (or
//! clones of its client) to every part of the application that needs live
//! updates. Dropping the last context tears the connection down.
//!
//! # Example
//!
//! ```no_run
//! use realtime_relay::{ClientOptions, Result, SharedContext, topics};
//!
//! # async fn example() -> Result<()> {
//! let options = ClientOptions::new("ws://localhost:8080/ws".parse()?)
//!     .with_token("session-token");
//! let context = SharedContext::init(options)?;
//!
//! let dashboard = context.consumer();
//! dashboard.activate().await?;
//! dashboard.on_stages(|update| println!("{}", update.body));
//!
//! context.shutdown();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::client::{ClientOptions, RealtimeClient, Subscription};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::Result;
use crate::identifiers::Topic;
use crate::protocol::Update;

// ============================================================================
// SharedContext
// ============================================================================

/// Owner of the application's single [`RealtimeClient`].
///
/// Clones share the client; the connection is torn down when the last
/// clone is dropped or on [`shutdown`](Self::shutdown).
#[derive(Debug, Clone)]
pub struct SharedContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    client: RealtimeClient,
    shut_down: AtomicBool,
}

impl SharedContext {
    /// Creates the application client from options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the options are
    /// invalid.
    pub fn init(options: ClientOptions) -> Result<Self> {
        Ok(Self::from_client(RealtimeClient::new(options)?))
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn from_client(client: RealtimeClient) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                client,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the shared client.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &RealtimeClient {
        &self.inner.client
    }

    /// Creates a consumer with default options.
    #[inline]
    #[must_use]
    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.inner.client.clone())
    }

    /// Creates a consumer with explicit options.
    #[inline]
    #[must_use]
    pub fn consumer_with(&self, options: ConsumerOptions) -> Consumer {
        Consumer::with_options(self.inner.client.clone(), options)
    }

    /// Subscribes directly on the shared client.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> Subscription
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.inner.client.subscribe(topic, callback)
    }

    /// Connects the shared client.
    ///
    /// # Errors
    ///
    /// See [`RealtimeClient::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.inner.client.connect().await
    }

    /// Returns `true` while the shared transport is live.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    /// Disconnects the shared client. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) ran.
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl ContextInner {
    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.client.disconnect();
            info!("Realtime context shut down");
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::topics;

    fn context() -> SharedContext {
        let client = RealtimeClient::builder()
            .endpoint("ws://127.0.0.1:9/ws")
            .build()
            .expect("client");
        SharedContext::from_client(client)
    }

    #[test]
    fn test_init_validates_options() {
        let options = ClientOptions::new("http://localhost/ws".parse().expect("url"));
        assert!(SharedContext::init(options).is_err());
    }

    #[test]
    fn test_consumers_share_one_client() {
        let context = context();
        let first = context.consumer();
        let second = context.consumer_with(ConsumerOptions::manual());

        first.on_orders(|_| {});
        second.on_orders(|_| {});

        assert_eq!(context.client().subscription_count(), 2);
        assert_eq!(context.client().topic_count(), 1);
    }

    #[test]
    fn test_shutdown_clears_registry_once() {
        let context = context();
        let _sub = context.subscribe(topics::DEFECTS, |_| {});

        context.shutdown();
        context.shutdown();

        assert!(context.is_shut_down());
        assert_eq!(context.client().subscription_count(), 0);
        assert!(!context.is_connected());
    }

    #[test]
    fn test_drop_of_last_clone_disconnects() {
        let context = context();
        let client = context.client().clone();
        let _sub = context.subscribe(topics::ORDERS, |_| {});

        let clone = context.clone();
        drop(context);
        assert_eq!(client.subscription_count(), 1);

        drop(clone);
        assert_eq!(client.subscription_count(), 0);
    }
}
